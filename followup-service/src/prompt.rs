//! Prompt template and post-processing of the generated text.

/// Markers at which the generated follow-up question is cut off
const STOP_MARKERS: [&str; 2] = ["Question:", "Answer:"];

/// Embeds the question and answer into the fixed instruction template
pub fn build_prompt(question: &str, answer: &str) -> String {
    format!(
        "Below is a Conversation between a human and AI agent. Provide the corresponding followup question of the Question and answer provided. Question:{question} \n Answer:{answer}\n FollowUp Question:"
    )
}

/// Drops the echoed prompt from the generated text, counting characters
pub fn strip_prompt<'a>(generated: &'a str, prompt: &str) -> &'a str {
    let prompt_chars = prompt.chars().count();
    match generated.char_indices().nth(prompt_chars) {
        Some((offset, _)) => &generated[offset..],
        None => "",
    }
}

/// Cuts `text` at the earliest stop marker.
///
/// A marker found at the very start of `text` does not count, so a
/// continuation that opens with `Question:` is returned whole.
pub fn truncate_at_markers(text: &str) -> &str {
    let cutoff = STOP_MARKERS
        .iter()
        .map(|marker| match text.find(marker) {
            Some(index) if index > 0 => index,
            _ => text.len(),
        })
        .min()
        .unwrap_or(text.len());
    if cutoff > 0 {
        text[..cutoff].trim()
    } else {
        text
    }
}

/// Extracts the follow-up question from the text the model generated for
/// `prompt`
pub fn extract_follow_up(generated: &str, prompt: &str) -> String {
    let response = strip_prompt(generated, prompt).trim();
    truncate_at_markers(response).to_string()
}
