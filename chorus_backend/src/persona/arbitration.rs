use std::sync::Arc;

use crate::chat::{mention_ids, ChatMessage};
use crate::config::MentionPolicy;
use crate::directory::BotDirectory;
use crate::persona::validator::ValidatedResponse;

/// Pre- and post-decision gates for one persona.
pub struct Arbitrator {
    self_name: String,
    self_id: String,
    mention_policy: MentionPolicy,
    directory: Arc<BotDirectory>,
}

impl Arbitrator {
    pub fn new(
        self_name: &str,
        self_id: &str,
        mention_policy: MentionPolicy,
        directory: Arc<BotDirectory>,
    ) -> Self {
        Self {
            self_name: self_name.to_string(),
            self_id: self_id.to_string(),
            mention_policy,
            directory,
        }
    }

    fn is_mentioned(&self, event: &ChatMessage) -> bool {
        event.mentions.iter().any(|id| id == &self.self_id)
            || mention_ids(&event.content).iter().any(|id| id == &self.self_id)
    }

    /// Whether a backend call is worth making for `event` at all.
    ///
    /// Messages from peer bots only get through when they ask something or
    /// name this persona, which keeps bots from answering each other forever.
    pub fn should_attempt(&self, event: &ChatMessage) -> bool {
        if self.is_mentioned(event) {
            return true;
        }
        if !event.author.is_bot {
            return true;
        }
        event.content.contains('?')
            || event
                .content
                .to_lowercase()
                .contains(&self.self_name.to_lowercase())
    }

    /// Whether a validated reply may be posted.
    pub fn should_post(
        &self,
        validated: Option<&ValidatedResponse>,
        other_persona_names: &[String],
    ) -> bool {
        let Some(text) = validated.and_then(ValidatedResponse::reply_text) else {
            return false;
        };

        if self.mention_policy == MentionPolicy::Off
            || self.mentions_other_persona(text, other_persona_names)
        {
            return true;
        }

        match self.mention_policy {
            MentionPolicy::Require => {
                tracing::info!(
                    "{}: suppressing reply that mentions no other persona",
                    self.self_name
                );
                false
            }
            _ => {
                tracing::warn!(
                    "{}: posting reply that mentions no other persona",
                    self.self_name
                );
                true
            }
        }
    }

    /// A literal `@Name` or a mention token whose id belongs to another persona.
    pub fn mentions_other_persona(&self, text: &str, other_persona_names: &[String]) -> bool {
        let is_other = |name: &str| {
            !name.eq_ignore_ascii_case(&self.self_name)
                && other_persona_names
                    .iter()
                    .any(|other| other.eq_ignore_ascii_case(name))
        };

        let lowered = text.to_lowercase();
        let literal = other_persona_names
            .iter()
            .filter(|name| is_other(name.as_str()))
            .any(|name| lowered.contains(&format!("@{}", name.to_lowercase())));
        if literal {
            return true;
        }

        mention_ids(text)
            .iter()
            .filter(|id| id.as_str() != self.self_id)
            .filter_map(|id| self.directory.name_for_id(id))
            .any(|name| is_other(name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{bot_message, human_message};

    fn others() -> Vec<String> {
        vec!["Bo".to_string()]
    }

    fn directory() -> Arc<BotDirectory> {
        let directory = BotDirectory::in_memory();
        directory.register("Ada", "1").unwrap();
        directory.register("Bo", "2").unwrap();
        Arc::new(directory)
    }

    fn ada(policy: MentionPolicy) -> Arbitrator {
        Arbitrator::new("Ada", "1", policy, directory())
    }

    fn reply(should_respond: bool, response: Option<&str>) -> ValidatedResponse {
        ValidatedResponse {
            reflection: "r".to_string(),
            should_respond,
            reason: "x".to_string(),
            response: response.map(str::to_string),
        }
    }

    #[test]
    fn humans_always_get_an_attempt() {
        let ada = ada(MentionPolicy::Warn);
        assert!(ada.should_attempt(&human_message("m", "sam", "nice weather")));
    }

    #[test]
    fn peer_bot_statement_without_question_or_name_is_skipped() {
        let ada = ada(MentionPolicy::Warn);
        let event = bot_message("m", "2", "Bo", "I agree with that.");
        assert!(!ada.should_attempt(&event));
    }

    #[test]
    fn peer_bot_question_or_name_gets_an_attempt() {
        let ada = ada(MentionPolicy::Warn);
        assert!(ada.should_attempt(&bot_message("m", "2", "Bo", "what do you think?")));
        assert!(ada.should_attempt(&bot_message("m", "2", "Bo", "ada has a point.")));
    }

    #[test]
    fn explicit_mention_always_gets_an_attempt() {
        let ada = ada(MentionPolicy::Warn);
        let mut event = bot_message("m", "2", "Bo", "over to you.");
        event.mentions.push("1".to_string());
        assert!(ada.should_attempt(&event));

        let event = bot_message("m", "2", "Bo", "<@!1> over to you.");
        assert!(ada.should_attempt(&event));
    }

    #[test]
    fn declined_or_missing_response_is_never_posted() {
        let ada = ada(MentionPolicy::Off);
        assert!(!ada.should_post(None, &others()));
        assert!(!ada.should_post(Some(&reply(false, Some("@Bo hi"))), &others()));
        assert!(!ada.should_post(Some(&reply(false, None)), &others()));
    }

    #[test]
    fn mention_check_accepts_literal_name_or_peer_token() {
        let ada = ada(MentionPolicy::Require);
        assert!(ada.should_post(Some(&reply(true, Some("hey @bo, agreed"))), &others()));
        assert!(ada.should_post(Some(&reply(true, Some("<@2> agreed"))), &others()));
        // Naming yourself does not count
        assert!(!ada.mentions_other_persona("@Ada here", &["Ada".to_string()]));
    }

    #[test]
    fn own_or_human_tokens_do_not_satisfy_require() {
        let ada = ada(MentionPolicy::Require);
        assert!(!ada.should_post(Some(&reply(true, Some("<@1> thinks so"))), &others()));
        assert!(!ada.should_post(Some(&reply(true, Some("thanks <@987654>"))), &others()));
    }

    #[test]
    fn token_for_unconfigured_bot_does_not_count() {
        let directory = directory();
        directory.register("Cy", "3").unwrap();
        let ada = Arbitrator::new("Ada", "1", MentionPolicy::Require, directory);
        // Cy is known to the directory but not one of this chat's personas
        assert!(!ada.should_post(Some(&reply(true, Some("<@3> hi"))), &others()));
    }

    #[test]
    fn missing_mention_follows_policy() {
        let text = Some(reply(true, Some("agreed")));

        assert!(!ada(MentionPolicy::Require).should_post(text.as_ref(), &others()));
        assert!(ada(MentionPolicy::Warn).should_post(text.as_ref(), &others()));
        assert!(ada(MentionPolicy::Off).should_post(text.as_ref(), &others()));
    }
}
