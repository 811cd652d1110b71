pub mod model_thread;
pub mod models;
pub mod service;


/// Returns early with a [`models::ModelError::Msg`], formatted like `format!`.
#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::models::ModelError::Msg(format!($msg)))
    };
    ($err:expr $(,)?) => {
        return Err($crate::models::ModelError::Msg(format!($err)))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::models::ModelError::Msg(format!($fmt, $($arg)*)))
    };
}
