use strand_core::types::{ChatMessage, ContentBlock, Role};

/// Placeholder substituted for user images after the first round.
pub const IMAGE_PLACEHOLDER: &str = "[image]";

/// Build the message list for one round.
///
/// Returns a fresh list; `base` and `history` are never mutated, so later
/// rounds cannot observe changes made for an earlier one.
pub fn round_messages(
    base: &[ChatMessage],
    history: &[ChatMessage],
    round: usize,
) -> Vec<ChatMessage> {
    let snapshot: Vec<ChatMessage> = base.iter().chain(history.iter()).cloned().collect();
    if round > 1 {
        clear_user_images(snapshot)
    } else {
        snapshot
    }
}

/// Replace image blocks in user messages with a text placeholder.
pub fn clear_user_images(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    messages
        .into_iter()
        .map(|msg| {
            if msg.role != Role::User || !msg.has_images() {
                return msg;
            }
            let content = msg
                .content
                .into_iter()
                .map(|block| match block {
                    ContentBlock::Image { .. } => ContentBlock::Text {
                        text: IMAGE_PLACEHOLDER.to_string(),
                    },
                    other => other,
                })
                .collect();
            ChatMessage {
                role: msg.role,
                content,
            }
        })
        .collect()
}

/// Initial prompt: optional instruction as system message, then the query
/// with any image urls attached.
pub fn initial_messages(instruction: &str, query: &str, image_urls: &[String]) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if !instruction.trim().is_empty() {
        messages.push(ChatMessage::system(instruction));
    }
    let mut content = vec![ContentBlock::Text {
        text: query.to_string(),
    }];
    content.extend(
        image_urls
            .iter()
            .map(|url| ContentBlock::Image { url: url.clone() }),
    );
    messages.push(ChatMessage {
        role: Role::User,
        content,
    });
    messages
}
