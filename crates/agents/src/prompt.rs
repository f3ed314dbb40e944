use corral_common::HistoryTurn;

/// Build the prompt for a turn, prefixing up to `max_turns` of the most
/// recent thread history when the agent has not seen it yet.
pub fn build_prompt(message: &str, history: &[HistoryTurn], max_turns: usize) -> String {
    let start = history.len().saturating_sub(max_turns);
    let recent = &history[start..];
    if recent.is_empty() {
        return message.to_string();
    }

    let mut prompt = String::from("Earlier messages in this thread, oldest first:\n\n");
    for turn in recent {
        prompt.push_str(&format!("[{}]: {}\n", turn.author, turn.text.trim_end()));
    }
    prompt.push_str("\nCurrent request:\n");
    prompt.push_str(message);
    prompt
}

/// Identity variables exported into every agent run.
pub fn identity_env(
    conversation_id: &str,
    thread_id: &str,
    participant: &str,
) -> [(&'static str, String); 3] {
    [
        ("CORRAL_CONVERSATION_ID", conversation_id.to_string()),
        ("CORRAL_THREAD_ID", thread_id.to_string()),
        ("CORRAL_PARTICIPANT", participant.to_string()),
    ]
}
