//! Request card rendering.
//!
//! A card is the chat-visible face of a pending request: an embed posted to
//! the review channel that approvers react to. The card is presentation only;
//! the request kind is tracked in the store, but it is also stamped into the
//! card footer as a machine tag so an operator reading the channel can tell
//! the two card types apart without guessing from the title.

use crate::tracker::state::{EnrollmentPayload, RequestKind, Requester};

pub const ACCESS_CARD_TITLE: &str = "ACCESS REQUEST";
pub const ENROLLMENT_CARD_TITLE: &str = "DIRECTORY REQUEST";

const KIND_TAG_PREFIX: &str = "kind=";

/// One name/value pair rendered on a card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

impl CardField {
    fn inline(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
            inline: true,
        }
    }

    fn block(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
            inline: false,
        }
    }
}

/// A renderable request card, independent of the chat platform's wire shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Card {
    pub title: String,
    pub author_name: String,
    pub fields: Vec<CardField>,
    pub kind: RequestKind,
}

impl Card {
    /// Card for an access authorization request.
    pub fn access_request(requester: &Requester) -> Self {
        Self {
            title: ACCESS_CARD_TITLE.to_string(),
            author_name: requester.name.clone(),
            fields: vec![CardField::block(
                "Instructions",
                format!(
                    "React \u{1F44D} to grant {} access to the community.",
                    requester.name
                ),
            )],
            kind: RequestKind::AccessAuth,
        }
    }

    /// Card for a directory enrollment request.
    pub fn enrollment_request(requester: &Requester, payload: &EnrollmentPayload) -> Self {
        Self {
            title: ENROLLMENT_CARD_TITLE.to_string(),
            author_name: requester.name.clone(),
            fields: vec![
                CardField::inline("Email", &payload.email),
                CardField::inline("First Name", &payload.first_name),
                CardField::inline("Last Name", &payload.last_name),
                CardField::block(
                    "Instructions",
                    "React \u{1F44D} to approve this account, \u{1F44E} to reject it.",
                ),
            ],
            kind: RequestKind::DirectoryEnrollment,
        }
    }

    /// The machine tag rendered into the card footer.
    pub fn kind_tag(&self) -> String {
        format!("{}{}", KIND_TAG_PREFIX, self.kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::state::UserId;

    fn requester() -> Requester {
        Requester::new(UserId(7), "jane#1234")
    }

    #[test]
    fn test_access_card_shape() {
        let card = Card::access_request(&requester());

        assert_eq!(card.title, "ACCESS REQUEST");
        assert_eq!(card.author_name, "jane#1234");
        assert_eq!(card.kind, RequestKind::AccessAuth);
        assert_eq!(card.fields.len(), 1);
        assert!(card.fields[0].value.contains("jane#1234"));
    }

    #[test]
    fn test_enrollment_card_carries_identity_fields() {
        let payload = EnrollmentPayload::validate("Jane", "Doe", "jane@example.com").unwrap();
        let card = Card::enrollment_request(&requester(), &payload);

        assert_eq!(card.title, "DIRECTORY REQUEST");
        assert_eq!(card.kind, RequestKind::DirectoryEnrollment);

        let names: Vec<&str> = card.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["Email", "First Name", "Last Name", "Instructions"]);
        assert_eq!(card.fields[0].value, "jane@example.com");
    }

    #[test]
    fn test_kind_tag_is_the_stable_machine_tag() {
        let card = Card::access_request(&requester());
        assert_eq!(card.kind_tag(), "kind=access_auth");

        let payload = EnrollmentPayload::validate("Jane", "Doe", "jane@example.com").unwrap();
        let card = Card::enrollment_request(&requester(), &payload);
        assert_eq!(card.kind_tag(), "kind=directory_enrollment");
    }
}
