use std::sync::Arc;

use anonchat_shared::errors::AppResult;

use crate::gateway::{Localizer, NoticeKey, Outbound};
use crate::matching::engine::now;
use crate::matching::MatchmakingEngine;
use crate::moderation::ModerationWorkflow;
use crate::models::UserId;
use crate::premium;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Start,
    Help,
    Next,
    Stop,
    Report,
    Unknown(&'a str),
    Text(&'a str),
}

impl<'a> Command<'a> {
    /// `/cmd` or `/cmd@name`, case-insensitive. Anything not starting with
    /// `/` is text.
    pub fn parse(input: &'a str) -> Self {
        let input = input.trim();
        let Some(rest) = input.strip_prefix('/') else {
            return Command::Text(input);
        };
        let word = rest.split_whitespace().next().unwrap_or_default();
        let name = word.split('@').next().unwrap_or_default();
        match name.to_ascii_lowercase().as_str() {
            "start" => Command::Start,
            "help" => Command::Help,
            "next" => Command::Next,
            "stop" => Command::Stop,
            "report" => Command::Report,
            _ => Command::Unknown(word),
        }
    }
}

/// Routes one inbound user event to the engine or the moderation workflow.
#[derive(Clone)]
pub struct CommandDispatcher {
    engine: MatchmakingEngine,
    moderation: ModerationWorkflow,
    localizer: Arc<Localizer>,
}

impl CommandDispatcher {
    pub fn new(engine: MatchmakingEngine, moderation: ModerationWorkflow, localizer: Arc<Localizer>) -> Self {
        Self { engine, moderation, localizer }
    }

    pub fn engine(&self) -> &MatchmakingEngine {
        &self.engine
    }

    /// Handle one message from `user`. `language_hint` is the client's
    /// preferred language, if it sent one.
    pub async fn handle(&self, user: UserId, text: &str, language_hint: Option<&str>) -> AppResult<()> {
        let now = now();
        let language = self.localizer.resolve(language_hint);
        let profile = self.engine.users.touch(user, &language, now).await?;

        if let Some(notice) = premium::surface_expiry(self.engine.users.as_ref(), &profile, now).await? {
            self.engine.deliver(vec![notice]).await;
        }

        let command = Command::parse(text);
        tracing::debug!(user_id = %user, command = command_name(&command), "inbound event");

        match command {
            Command::Start => {
                if profile.banned {
                    return self.notify(user, NoticeKey::Banned).await;
                }
                if language_hint.is_some() && profile.language != language {
                    self.engine.users.set_language(user, &language).await?;
                }
                self.notify(user, NoticeKey::Hello).await
            }
            Command::Help => self.notify(user, NoticeKey::Help).await,
            Command::Next => self.engine.request_match(user).await.map(|_| ()),
            Command::Stop => {
                if profile.banned {
                    return self.notify(user, NoticeKey::Banned).await;
                }
                self.engine.stop(user).await.map(|_| ())
            }
            Command::Report => {
                if profile.banned {
                    return self.notify(user, NoticeKey::Banned).await;
                }
                self.moderation.report(user).await.map(|_| ())
            }
            Command::Unknown(word) => {
                tracing::debug!(user_id = %user, command = word, "ignoring unknown command");
                Ok(())
            }
            Command::Text("") => Ok(()),
            Command::Text(text) => {
                if profile.banned {
                    return self.notify(user, NoticeKey::Banned).await;
                }
                if self.moderation.finalize_report(user, text).await?.is_some() {
                    return Ok(());
                }
                if self.engine.relay(user, text).await? {
                    return Ok(());
                }
                self.notify(user, NoticeKey::SendNext).await
            }
        }
    }

    async fn notify(&self, user: UserId, key: NoticeKey) -> AppResult<()> {
        self.engine.deliver(vec![Outbound::notice(user, key)]).await;
        Ok(())
    }
}

/// Log-safe name of a command. Free text is never logged.
fn command_name(command: &Command<'_>) -> &'static str {
    match command {
        Command::Start => "start",
        Command::Help => "help",
        Command::Next => "next",
        Command::Stop => "stop",
        Command::Report => "report",
        Command::Unknown(_) => "unknown",
        Command::Text(_) => "text",
    }
}
