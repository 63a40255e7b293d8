use once_cell::sync::Lazy;
use regex::Regex;

/// Caption length limit for a Tweet with attached media.
pub const CAPTION_LIMIT: usize = 240;

static STATUS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https://(?:twitter|x)\.com/[A-Za-z0-9_]+/status/([0-9]+)")
        .unwrap_or_else(|e| panic!("invalid status URL pattern: {e}"))
});

/// An incoming chat event, already stripped of transport details.
#[derive(Debug, Clone)]
pub enum Event {
    /// A voice note or audio file. `file_id` keys the temp download.
    Audio { file_id: String, duration_secs: u32 },
    Text(String),
}

/// What the transport layer should do in response to an event.
///
/// The session itself never talks to Telegram or Twitter; it only
/// mutates its own state and hands one of these back.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Silently drop the event.
    None,
    /// Send a plain text reply.
    Reply(String),
    /// Send a Markdown reply with link previews disabled.
    ReplyMarkdown(String),
    /// The handshake matched: persist `user_id` and confirm.
    Linked { user_id: u64, reply: String },
    /// Look up a tweet and, if it exists, enter reply mode.
    Resolve { tweet_id: u64 },
    /// Download, convert and publish the attachment.
    PublishAudio { file_id: String, duration_secs: u32 },
}

/// Where the next audio goes.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishMode {
    Tweet,
    Reply { target_id: u64, author: String },
    Dm(String),
}

/// Per-process session state for the single authorized user.
pub struct Session {
    linked_user_id: Option<u64>,
    link_code: Option<String>,
    reply_target_id: Option<u64>,
    reply_author: Option<String>,
    dm_user: Option<String>,
    caption: String,
}

const LINKED_REPLY: &str = "Bot successfully linked. You can send me voice notes and I will \
    Tweet them as a video, or send me a link to a Tweet first and I will post the audio as a \
    reply to it.\nYou can also add text to the Tweet using \"/text <your text here>\". To \
    remove the text, just send that command with no text.\nSend direct messages with \
    /dm <user>. @ is not needed.";

const HELP_REPLY: &str = "Available commands:\n\
    \u{b7} /text <text> - Sets the text for your next Tweet or DM.\n\
    \u{b7} /dm <user> - Sends audios to a user through DM instead of posting Tweets. \
    Sending no user will exit DM mode.\n\
    \u{b7} Send a link to a Tweet and I'll reply to that one.\n\
    \u{b7} /cancel - Exits reply mode and posts next audios as a normal Tweet.\n\
    \u{b7} Send an audio or a music file and I will post that audio with the previous \
    configurations. If the file is longer than 2:20 mins, it will be cut at that time.\n\
    \u{b7} /help - Shows this help.\n\
    \u{b7} /about - Shows the about page.";

impl Session {
    pub fn new(linked_user_id: Option<u64>, link_code: Option<String>) -> Self {
        Self {
            linked_user_id,
            link_code,
            reply_target_id: None,
            reply_author: None,
            dm_user: None,
            caption: String::new(),
        }
    }

    /// Single entry point for every incoming event.
    ///
    /// Unlinked: only a text message equal to the outstanding handshake
    /// code does anything. Linked: events from any other sender are
    /// silently dropped.
    pub fn handle_event(&mut self, sender_id: u64, event: Event) -> Action {
        match self.linked_user_id {
            None => {
                if let Event::Text(text) = &event {
                    if self.link_code.as_deref() == Some(text.trim()) {
                        self.link_code = None;
                        self.linked_user_id = Some(sender_id);
                        return Action::Linked {
                            user_id: sender_id,
                            reply: LINKED_REPLY.to_string(),
                        };
                    }
                }
                Action::None
            }
            Some(linked) if linked == sender_id => match event {
                Event::Audio {
                    file_id,
                    duration_secs,
                } => Action::PublishAudio {
                    file_id,
                    duration_secs,
                },
                Event::Text(text) => self.handle_text(&text),
            },
            Some(_) => Action::None,
        }
    }

    fn handle_text(&mut self, text: &str) -> Action {
        // A status URL anywhere in the message takes precedence over commands.
        if let Some(captures) = STATUS_URL.captures(text) {
            if let Some(id) = captures.get(1).and_then(|m| m.as_str().parse::<u64>().ok()) {
                return Action::Resolve { tweet_id: id };
            }
        }

        if text == "/cancel" {
            self.reply_target_id = None;
            self.reply_author = None;
            return Action::Reply("Now posting as a new Tweet.".to_string());
        }

        if let Some(body) = command_body(text, "/text") {
            self.caption = truncate_caption(body);
            return if self.caption.is_empty() {
                Action::Reply("Text cleared.".to_string())
            } else {
                Action::Reply(format!("Text set to: {}", self.caption))
            };
        }

        if let Some(body) = command_body(text, "/dm") {
            // Reply mode and DM mode are mutually exclusive; last one set wins.
            self.reply_target_id = None;
            self.reply_author = None;
            let handle = body.trim().trim_start_matches('@');
            if handle.is_empty() {
                self.dm_user = None;
                return Action::Reply("DM cancelled.".to_string());
            }
            self.dm_user = Some(handle.to_string());
            return Action::Reply(format!(
                "Sending DM to @{handle}. Send /dm with no user to exit DM mode."
            ));
        }

        if text == "/help" {
            return Action::Reply(HELP_REPLY.to_string());
        }

        if text == "/about" {
            return Action::ReplyMarkdown(format!(
                "*About:*\n*audiotweet v{}*\n\nPosts your Telegram voice notes to Twitter \
                 as videos, as Tweets, replies or DMs.",
                env!("CARGO_PKG_VERSION")
            ));
        }

        // Anything else is deliberately ignored, no reply.
        Action::None
    }

    /// Called after a successful tweet lookup. Entering reply mode
    /// leaves DM mode.
    pub fn set_reply_target(&mut self, tweet_id: u64, author: &str) {
        self.reply_target_id = Some(tweet_id);
        self.reply_author = Some(author.to_string());
        self.dm_user = None;
    }

    pub fn publish_mode(&self) -> PublishMode {
        if let Some(id) = self.reply_target_id {
            PublishMode::Reply {
                target_id: id,
                author: self.reply_author.clone().unwrap_or_default(),
            }
        } else if let Some(user) = &self.dm_user {
            PublishMode::Dm(user.clone())
        } else {
            PublishMode::Tweet
        }
    }

    pub fn caption(&self) -> &str {
        &self.caption
    }

    /// The caption is single-use: cleared after each successful publish.
    pub fn clear_caption(&mut self) {
        self.caption.clear();
    }
}

/// Extracts the body of `/cmd` or `/cmd <body>`. Returns `None` when
/// `text` is some other command (e.g. "/textual" does not match "/text").
fn command_body<'a>(text: &'a str, command: &str) -> Option<&'a str> {
    if text == command {
        return Some("");
    }
    text.strip_prefix(command)
        .and_then(|rest| rest.strip_prefix(' '))
}

/// Trims a caption to the limit by dropping whole trailing words. A
/// single word longer than the limit is cut hard at LIMIT - 1 chars.
fn truncate_caption(text: &str) -> String {
    let mut out = text.trim().to_string();
    while out.chars().count() > CAPTION_LIMIT {
        match out.rfind(' ') {
            Some(pos) => {
                out.truncate(pos);
                while out.ends_with(' ') {
                    out.pop();
                }
            }
            None => {
                out = out.chars().take(CAPTION_LIMIT - 1).collect();
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: u64 = 42;

    fn linked_session() -> Session {
        Session::new(Some(USER), None)
    }

    fn text_event(text: &str) -> Event {
        Event::Text(text.to_string())
    }

    #[test]
    fn test_link_handshake() {
        let mut session = Session::new(None, Some("abc123".to_string()));

        // Wrong code does nothing.
        assert_eq!(session.handle_event(USER, text_event("nope")), Action::None);

        // Right code links to the sender.
        match session.handle_event(USER, text_event("abc123")) {
            Action::Linked { user_id, .. } => assert_eq!(user_id, USER),
            other => panic!("expected Linked, got {other:?}"),
        }

        // Linked now: commands work for the linked sender.
        assert_ne!(session.handle_event(USER, text_event("/help")), Action::None);

        // The code is consumed; repeating it is just unknown text.
        assert_eq!(
            session.handle_event(USER, text_event("abc123")),
            Action::None
        );
    }

    #[test]
    fn test_unlinked_ignores_audio() {
        let mut session = Session::new(None, Some("abc123".to_string()));
        let event = Event::Audio {
            file_id: "f1".to_string(),
            duration_secs: 10,
        };
        assert_eq!(session.handle_event(USER, event), Action::None);
    }

    #[test]
    fn test_foreign_sender_is_dropped() {
        let mut session = linked_session();
        assert_eq!(session.handle_event(7, text_event("/help")), Action::None);
        let event = Event::Audio {
            file_id: "f1".to_string(),
            duration_secs: 10,
        };
        assert_eq!(session.handle_event(7, event), Action::None);
    }

    #[test]
    fn test_audio_from_linked_user_publishes() {
        let mut session = linked_session();
        let event = Event::Audio {
            file_id: "f1".to_string(),
            duration_secs: 90,
        };
        assert_eq!(
            session.handle_event(USER, event),
            Action::PublishAudio {
                file_id: "f1".to_string(),
                duration_secs: 90
            }
        );
    }

    #[test]
    fn test_status_url_resolves() {
        let mut session = linked_session();
        let action = session.handle_event(
            USER,
            text_event("https://twitter.com/foo/status/12345"),
        );
        assert_eq!(action, Action::Resolve { tweet_id: 12345 });

        // Also accepts the x.com host and URLs embedded in other text.
        let action = session.handle_event(
            USER,
            text_event("check this https://x.com/some_user/status/999 out"),
        );
        assert_eq!(action, Action::Resolve { tweet_id: 999 });
    }

    #[test]
    fn test_reply_mode_clears_dm_mode() {
        let mut session = linked_session();
        session.handle_event(USER, text_event("/dm friend"));
        assert_eq!(session.publish_mode(), PublishMode::Dm("friend".to_string()));

        session.set_reply_target(12345, "foo");
        assert_eq!(
            session.publish_mode(),
            PublishMode::Reply {
                target_id: 12345,
                author: "foo".to_string()
            }
        );
    }

    #[test]
    fn test_dm_clears_reply_mode() {
        let mut session = linked_session();
        session.set_reply_target(12345, "foo");

        let action = session.handle_event(USER, text_event("/dm @friend"));
        assert_eq!(
            action,
            Action::Reply(
                "Sending DM to @friend. Send /dm with no user to exit DM mode.".to_string()
            )
        );
        assert_eq!(session.publish_mode(), PublishMode::Dm("friend".to_string()));
    }

    #[test]
    fn test_dm_without_handle_exits_dm_mode() {
        let mut session = linked_session();
        session.handle_event(USER, text_event("/dm friend"));

        let action = session.handle_event(USER, text_event("/dm"));
        assert_eq!(action, Action::Reply("DM cancelled.".to_string()));
        assert_eq!(session.publish_mode(), PublishMode::Tweet);
    }

    #[test]
    fn test_cancel_without_pending_reply() {
        let mut session = linked_session();
        let action = session.handle_event(USER, text_event("/cancel"));
        assert_eq!(
            action,
            Action::Reply("Now posting as a new Tweet.".to_string())
        );
        assert_eq!(session.publish_mode(), PublishMode::Tweet);
    }

    #[test]
    fn test_cancel_exits_reply_mode() {
        let mut session = linked_session();
        session.set_reply_target(12345, "foo");
        session.handle_event(USER, text_event("/cancel"));
        assert_eq!(session.publish_mode(), PublishMode::Tweet);
    }

    #[test]
    fn test_text_stores_short_caption_unchanged() {
        let mut session = linked_session();
        let action = session.handle_event(USER, text_event("/text hello world"));
        assert_eq!(action, Action::Reply("Text set to: hello world".to_string()));
        assert_eq!(session.caption(), "hello world");
    }

    #[test]
    fn test_text_without_body_clears_caption() {
        let mut session = linked_session();
        session.handle_event(USER, text_event("/text something"));
        let action = session.handle_event(USER, text_event("/text"));
        assert_eq!(action, Action::Reply("Text cleared.".to_string()));
        assert_eq!(session.caption(), "");
    }

    #[test]
    fn test_long_caption_cut_at_word_boundary() {
        let mut session = linked_session();
        let word = "word ".repeat(60); // 300 chars
        session.handle_event(USER, text_event(&format!("/text {word}")));

        let stored = session.caption().to_string();
        assert!(stored.chars().count() <= CAPTION_LIMIT);
        assert!(word.starts_with(&stored));
        assert!(!stored.ends_with(' '));
    }

    #[test]
    fn test_unbroken_caption_cut_at_239() {
        let mut session = linked_session();
        let body = "a".repeat(300);
        session.handle_event(USER, text_event(&format!("/text {body}")));
        assert_eq!(session.caption().chars().count(), 239);
        assert!(body.starts_with(session.caption()));
    }

    #[test]
    fn test_caption_cleared_after_publish() {
        let mut session = linked_session();
        session.handle_event(USER, text_event("/text my caption"));
        session.clear_caption();
        assert_eq!(session.caption(), "");
    }

    #[test]
    fn test_unknown_text_is_ignored() {
        let mut session = linked_session();
        assert_eq!(
            session.handle_event(USER, text_event("hello there")),
            Action::None
        );
        assert_eq!(
            session.handle_event(USER, text_event("/textual healing")),
            Action::None
        );
    }

    #[test]
    fn test_help_and_about() {
        let mut session = linked_session();
        match session.handle_event(USER, text_event("/help")) {
            Action::Reply(text) => assert!(text.contains("/cancel")),
            other => panic!("expected Reply, got {other:?}"),
        }
        match session.handle_event(USER, text_event("/about")) {
            Action::ReplyMarkdown(text) => assert!(text.contains("audiotweet")),
            other => panic!("expected ReplyMarkdown, got {other:?}"),
        }
    }

    #[test]
    fn test_truncate_caption_respects_exact_limit() {
        let text = "b".repeat(240);
        assert_eq!(truncate_caption(&text), text);
    }
}
