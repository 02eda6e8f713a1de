//! Conversation history handed to the inference call on every turn.
//!
//! The history is split into three regions:
//!
//! * the preserved prefix: every leading system message (base prompt, caller
//!   prompt, recalled memories) plus the first user instruction; never evicted.
//! * the sticky output buffer: messages the model pinned with `output(...)`.
//! * the rolling suffix: screenshots and replies, pruned before every call.
//!
//! [`ConversationContext::messages`] renders them in that order.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn is_image(&self) -> bool {
        matches!(self, ContentPart::ImageUrl { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: Content::Text(text.into()) }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: Content::Text(text.into()) }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: Content::Text(text.into()) }
    }

    pub fn screenshot(url: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::Parts(vec![ContentPart::ImageUrl {
                image_url: ImageUrl { url: url.into() },
            }]),
        }
    }

    pub fn image_count(&self) -> usize {
        match &self.content {
            Content::Text(_) => 0,
            Content::Parts(parts) => parts.iter().filter(|p| p.is_image()).count(),
        }
    }

    /// Units charged against the message budget: one per non-image part when
    /// the content is decomposed, otherwise one for the whole message.
    pub fn text_units(&self) -> usize {
        match &self.content {
            Content::Text(_) => 1,
            Content::Parts(parts) => {
                let n = parts.iter().filter(|p| !p.is_image()).count();
                n.max(1)
            }
        }
    }

    /// Copy of the message with image parts removed. `None` when nothing
    /// textual is left.
    fn without_images(&self) -> Option<Message> {
        match &self.content {
            Content::Text(_) => Some(self.clone()),
            Content::Parts(parts) => {
                let mut kept: Vec<ContentPart> =
                    parts.iter().filter(|p| !p.is_image()).cloned().collect();
                let content = match kept.len() {
                    0 => return None,
                    1 => match kept.remove(0) {
                        ContentPart::Text { text } => Content::Text(text),
                        other => Content::Parts(vec![other]),
                    },
                    _ => Content::Parts(kept),
                };
                Some(Message { role: self.role, content })
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowLimits {
    pub max_images: usize,
    pub max_messages: usize,
}

impl Default for WindowLimits {
    fn default() -> Self {
        Self { max_images: 5, max_messages: 20 }
    }
}

/// Length of the preserved prefix: the leading run of system messages plus
/// the first user message right after it.
pub fn preserved_prefix_len(messages: &[Message]) -> usize {
    let systems = messages.iter().take_while(|m| m.role == Role::System).count();
    match messages.get(systems) {
        Some(m) if m.role == Role::User => systems + 1,
        _ => systems,
    }
}

/// Bounded-resource eviction over `suffix`. Returns the kept messages in
/// chronological order.
pub fn prune_suffix(suffix: &[Message], limits: WindowLimits) -> Vec<Message> {
    let mut keep = vec![false; suffix.len()];
    let mut images = 0usize;
    let mut units = 0usize;

    for (idx, msg) in suffix.iter().enumerate().rev() {
        let n_images = msg.image_count();
        if n_images > 0 {
            if images + n_images <= limits.max_images {
                images += n_images;
                keep[idx] = true;
            }
        } else {
            let n_units = msg.text_units();
            if units + n_units <= limits.max_messages {
                units += n_units;
                keep[idx] = true;
            }
        }
        if images >= limits.max_images && units >= limits.max_messages {
            break;
        }
    }

    suffix
        .iter()
        .zip(keep)
        .filter_map(|(m, k)| k.then(|| m.clone()))
        .collect()
}

#[derive(Clone, Debug, Default)]
pub struct ConversationContext {
    prefix: Vec<Message>,
    sticky: Vec<Message>,
    history: Vec<Message>,
    limits: WindowLimits,
}

impl ConversationContext {
    pub fn new(limits: WindowLimits) -> Self {
        Self { limits, ..Default::default() }
    }

    /// Fresh prompt: base system prompt, optional caller prompt, recalled
    /// memories, then the instruction.
    pub fn setup_prompt(
        &mut self,
        system_prompt: &str,
        user_system_prompt: Option<&str>,
        memories: &[String],
        instruction: &str,
    ) {
        let mut msgs = vec![Message::system(system_prompt)];
        if let Some(p) = user_system_prompt.filter(|p| !p.trim().is_empty()) {
            msgs.push(Message::system(p));
        }
        if !memories.is_empty() {
            msgs.push(Message::system(format!("Memories:\n{}", memories.join("\n"))));
        }
        msgs.push(Message::user(instruction));
        self.load(msgs);
    }

    /// Rebuilds the context from a persisted sequence.
    pub fn restore(persisted: Vec<Message>, limits: WindowLimits) -> Self {
        let mut ctx = Self::new(limits);
        ctx.load(persisted);
        ctx
    }

    fn load(&mut self, mut messages: Vec<Message>) {
        let p = preserved_prefix_len(&messages);
        self.history = messages.split_off(p);
        self.prefix = messages;
        self.sticky.clear();
    }

    /// Appends to the rolling suffix. The prefix is only ever established by
    /// [`setup_prompt`](Self::setup_prompt) or [`restore`](Self::restore).
    pub fn push(&mut self, msg: Message) {
        self.history.push(msg);
    }

    pub fn push_screenshot(&mut self, url: impl Into<String>) {
        self.push(Message::screenshot(url));
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.push(Message::assistant(text));
    }

    /// Applies the eviction policy to the rolling suffix.
    pub fn prune(&mut self) {
        self.history = prune_suffix(&self.history, self.limits);
    }

    /// Pins the most recent message into the sticky output buffer.
    pub fn capture_output(&mut self) {
        if let Some(last) = self.messages().last().cloned() {
            self.sticky = vec![last];
        }
    }

    pub fn prefix_len(&self) -> usize {
        self.prefix.len()
    }

    pub fn limits(&self) -> WindowLimits {
        self.limits
    }

    pub fn sticky(&self) -> &[Message] {
        &self.sticky
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn messages(&self) -> Vec<Message> {
        self.prefix
            .iter()
            .chain(self.sticky.iter())
            .chain(self.history.iter())
            .cloned()
            .collect()
    }

    /// Flattened, image-free form stored on the task record.
    pub fn to_persisted(&self) -> Vec<Message> {
        self.messages().iter().filter_map(Message::without_images).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn framed() -> ConversationContext {
        let mut ctx = ConversationContext::new(WindowLimits { max_images: 2, max_messages: 3 });
        ctx.setup_prompt("sys", Some("caller"), &["likes dark mode".into()], "open settings");
        ctx
    }

    #[test]
    fn prefix_covers_systems_and_first_instruction() {
        let ctx = framed();
        assert_eq!(ctx.prefix_len(), 4);
        assert!(ctx.history().is_empty());
    }

    #[test]
    fn blank_caller_prompt_is_skipped() {
        let mut ctx = ConversationContext::new(WindowLimits::default());
        ctx.setup_prompt("sys", Some("  "), &[], "go");
        assert_eq!(ctx.prefix_len(), 2);
    }

    #[test]
    fn prune_keeps_newest_images_and_replies() {
        let mut ctx = framed();
        for i in 0..5 {
            ctx.push_screenshot(format!("img{i}"));
            ctx.push_assistant(format!("reply{i}"));
        }
        ctx.prune();
        let hist = ctx.history();
        assert_eq!(hist.iter().map(Message::image_count).sum::<usize>(), 2);
        assert_eq!(hist.iter().filter(|m| m.image_count() == 0).count(), 3);
        assert_eq!(hist.last(), Some(&Message::assistant("reply4")));
        assert_eq!(hist[0], Message::assistant("reply2"));
        assert_eq!(ctx.prefix_len(), 4);
    }

    #[test]
    fn sticky_output_survives_eviction() {
        let mut ctx = framed();
        ctx.push_screenshot("a");
        ctx.push_assistant("Action: output(content='pinned')");
        ctx.capture_output();
        for i in 0..6 {
            ctx.push_screenshot(format!("b{i}"));
            ctx.push_assistant(format!("r{i}"));
        }
        ctx.prune();
        let all = ctx.messages();
        assert_eq!(all[4], Message::assistant("Action: output(content='pinned')"));
        assert!(!ctx.history().contains(&Message::assistant("Action: output(content='pinned')")));
    }

    #[test]
    fn persisted_form_drops_images() {
        let mut ctx = framed();
        ctx.push_screenshot("img");
        ctx.push(Message {
            role: Role::User,
            content: Content::Parts(vec![
                ContentPart::Text { text: "note".into() },
                ContentPart::ImageUrl { image_url: ImageUrl { url: "x".into() } },
            ]),
        });
        ctx.push_assistant("Thought: ok");
        let persisted = ctx.to_persisted();
        assert_eq!(persisted.len(), 6);
        assert_eq!(persisted[4], Message::user("note"));

        let restored = ConversationContext::restore(persisted.clone(), WindowLimits::default());
        assert_eq!(restored.prefix_len(), 4);
        assert_eq!(restored.messages(), persisted);
    }

    #[test]
    fn content_wire_shape_matches_chat_api() {
        let v = serde_json::to_value(Message::screenshot("http://x/s.png")).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "role": "user",
                "content": [{"type": "image_url", "image_url": {"url": "http://x/s.png"}}]
            })
        );
        let v = serde_json::to_value(Message::system("hi")).unwrap();
        assert_eq!(v, serde_json::json!({"role": "system", "content": "hi"}));
    }
}
