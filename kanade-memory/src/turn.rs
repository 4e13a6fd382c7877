//! Conversation turn types.

use std::sync::Arc;

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// One piece of turn content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text(String),
    /// Raw image bytes, shared so history snapshots stay cheap.
    Image { mime_type: String, data: Arc<[u8]> },
}

/// A single conversation turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    /// Attach an image payload.
    pub fn with_image(mut self, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        self.parts.push(Part::Image {
            mime_type: mime_type.into(),
            data: Arc::from(data),
        });
        self
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                Part::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn image_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|p| matches!(p, Part::Image { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_as_str() {
        assert_eq!(Role::User.as_str(), "user");
        assert_eq!(Role::Assistant.as_str(), "assistant");
        assert_eq!(Role::System.as_str(), "system");
    }

    #[test]
    fn test_turn_with_images() {
        let turn = Turn::user("what is this?")
            .with_image("image/png", vec![1, 2, 3])
            .with_image("image/jpeg", vec![4]);
        assert_eq!(turn.role, Role::User);
        assert_eq!(turn.text(), "what is this?");
        assert_eq!(turn.image_count(), 2);
    }

    #[test]
    fn test_image_only_turn_has_empty_text() {
        let turn = Turn {
            role: Role::User,
            parts: vec![Part::Image {
                mime_type: "image/gif".into(),
                data: Arc::from(vec![0u8]),
            }],
        };
        assert!(turn.text().is_empty());
    }
}
