use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file submitted alongside a message.
///
/// Only the name reaches the transcript; see [`Attachment::marker`].
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// Textual reference embedded in the message body
    pub fn marker(&self) -> String {
        format!("[Image: {}]", self.name)
    }

    /// Append this attachment's marker to `text`
    ///
    /// Blank text yields the marker alone; anything else is kept verbatim.
    pub fn annotate(&self, text: &str) -> String {
        if text.trim().is_empty() {
            self.marker()
        } else {
            format!("{}\n{}", text, self.marker())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant entry that records a failed completion in the transcript
    pub fn failure(description: impl std::fmt::Display) -> Self {
        Self::assistant(format!("Error: {}", description))
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_marker() {
        let photo = Attachment::new("photo-1.jpg", "image/jpeg", vec![0xff, 0xd8]);
        assert!(photo.is_image());
        assert_eq!(photo.annotate("what is this?"), "what is this?\n[Image: photo-1.jpg]");
        assert_eq!(photo.annotate(""), "[Image: photo-1.jpg]");
        assert_eq!(photo.annotate("  \n"), "[Image: photo-1.jpg]");
        assert_eq!(photo.annotate("  x = 1\n"), "  x = 1\n\n[Image: photo-1.jpg]");
    }

    #[test]
    fn test_failure_message() {
        let msg = Message::failure("No Ollama server available");
        assert!(msg.is_assistant());
        assert_eq!(msg.content, "Error: No Ollama server available");
    }

    #[test]
    fn test_deserialize_without_id_or_timestamp() {
        let msg: Message =
            serde_json::from_str(r#"{"role":"assistant","content":"Hola"}"#).unwrap();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content, "Hola");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::user("hi")).unwrap();
        assert!(json.contains(r#""role":"user""#));
    }
}
