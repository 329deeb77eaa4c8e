use crate::chat::{ChatMessage, ChatTurn, Role};

pub const IMAGE_MARKER: &str = "[image attached]";

/// Flatten raw channel history into the turn sequence sent to the backend.
///
/// The first turn is always the system preamble (persona prompt, own mention
/// handle, roster of the other personas). Bot authors become `assistant`
/// turns, humans `user` turns, and every turn is prefixed with its speaker.
pub fn build_context<F>(
    recent: &[ChatMessage],
    system_prompt: &str,
    participant_names: &[String],
    self_name: &str,
    resolve_mention: F,
) -> Vec<ChatTurn>
where
    F: Fn(&str) -> String,
{
    let mut turns = Vec::with_capacity(recent.len() + 1);
    turns.push(ChatTurn::system(build_preamble(
        system_prompt,
        participant_names,
        self_name,
        &resolve_mention,
    )));

    for message in recent {
        turns.push(message_to_turn(message, &resolve_mention));
    }

    turns
}

fn build_preamble<F>(
    system_prompt: &str,
    participant_names: &[String],
    self_name: &str,
    resolve_mention: &F,
) -> String
where
    F: Fn(&str) -> String,
{
    let mut preamble = String::new();
    preamble.push_str(system_prompt.trim());
    preamble.push_str("\n\n");
    preamble.push_str(&format!(
        "You are {}. Your mention handle is {}.\n",
        self_name,
        resolve_mention(self_name)
    ));

    let others: Vec<&String> = participant_names
        .iter()
        .filter(|name| name.as_str() != self_name)
        .collect();

    if others.is_empty() {
        preamble.push_str("You are the only bot in this chat.");
    } else {
        preamble.push_str("Other bots in this chat (mention them with their handle):\n");
        for name in others {
            preamble.push_str(&format!("- {}: {}\n", name, resolve_mention(name)));
        }
    }

    preamble.trim_end().to_string()
}

fn message_to_turn<F>(message: &ChatMessage, resolve_mention: &F) -> ChatTurn
where
    F: Fn(&str) -> String,
{
    let author = &message.author;
    let (role, speaker) = if author.is_bot {
        // Bots outside the directory resolve to their bare name; no handle then
        let handle = resolve_mention(&author.display_name);
        let speaker = if handle == author.display_name {
            author.display_name.clone()
        } else {
            format!("{} ({})", author.display_name, handle)
        };
        (Role::Assistant, speaker)
    } else {
        (Role::User, author.display_name.clone())
    };

    let mut content = format!("{}: {}", speaker, message.content);
    if message.has_image() {
        content.push('\n');
        content.push_str(IMAGE_MARKER);
    }

    ChatTurn {
        role,
        content,
        author: Some(author.display_name.clone()),
        timestamp: Some(message.created_at.timestamp_millis()),
    }
}
