//! Boundary validation for incoming mutation events.
//!
//! Every event passes through [`validate`] before it may touch a channel's
//! store. A rejected event leaves the store untouched and the prior entity
//! value in place; the originating client is expected to re-render the
//! unchanged entity.

use crate::protocol::{EventKind, MutationEvent};

/// Validation failures, resolved at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Event lacks an entity id
    MissingIdentity,
    /// Update/add/reorder event arrived without a payload
    MissingPayload,
    /// A name/text field is present but trims to empty
    EmptyText,
    /// Reorder event carries no target order
    MissingOrder,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingIdentity => write!(f, "event is missing an entity id"),
            Self::MissingPayload => write!(f, "event requires a payload but carries none"),
            Self::EmptyText => write!(f, "name/text field trims to empty"),
            Self::MissingOrder => write!(f, "reorder event carries no order"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Check an event's minimum required shape.
///
/// - All events require a non-empty `id`.
/// - `Add` requires a payload whose `name` is non-empty after trim.
/// - `Update` requires a payload; a present `name` must not trim to empty.
/// - `Remove` tolerates an absent payload.
/// - `Reorder` requires a payload carrying an `order`.
pub fn validate(event: &MutationEvent) -> Result<(), ValidationError> {
    if event.id.trim().is_empty() {
        return Err(ValidationError::MissingIdentity);
    }

    match event.kind {
        EventKind::Add => {
            let payload = event.payload.as_ref().ok_or(ValidationError::MissingPayload)?;
            match &payload.name {
                Some(name) if !name.trim().is_empty() => Ok(()),
                _ => Err(ValidationError::EmptyText),
            }
        }
        EventKind::Update => {
            let payload = event.payload.as_ref().ok_or(ValidationError::MissingPayload)?;
            if let Some(name) = &payload.name {
                if name.trim().is_empty() {
                    return Err(ValidationError::EmptyText);
                }
            }
            Ok(())
        }
        EventKind::Remove => Ok(()),
        EventKind::Reorder => {
            let payload = event.payload.as_ref().ok_or(ValidationError::MissingPayload)?;
            if payload.order.is_none() && payload.parent_id.is_none() {
                return Err(ValidationError::MissingOrder);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EntityKind, EventPayload, MutationEvent};
    use uuid::Uuid;

    fn user() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn test_add_valid() {
        let event = MutationEvent::add(
            EntityKind::Section,
            "a",
            user(),
            EventPayload::named("Intro"),
            1,
        );
        assert!(validate(&event).is_ok());
    }

    #[test]
    fn test_missing_id_rejected() {
        let event = MutationEvent::add(EntityKind::Section, "", user(), EventPayload::named("x"), 1);
        assert_eq!(validate(&event), Err(ValidationError::MissingIdentity));

        // Whitespace-only id counts as missing
        let event =
            MutationEvent::add(EntityKind::Section, "  ", user(), EventPayload::named("x"), 1);
        assert_eq!(validate(&event), Err(ValidationError::MissingIdentity));
    }

    #[test]
    fn test_add_requires_name() {
        let event = MutationEvent::add(EntityKind::Goal, "g1", user(), EventPayload::default(), 1);
        assert_eq!(validate(&event), Err(ValidationError::EmptyText));
    }

    #[test]
    fn test_add_whitespace_name_rejected() {
        let event =
            MutationEvent::add(EntityKind::Goal, "g1", user(), EventPayload::named("   "), 1);
        assert_eq!(validate(&event), Err(ValidationError::EmptyText));
    }

    #[test]
    fn test_update_without_payload_rejected() {
        let mut event =
            MutationEvent::update(EntityKind::Section, "a", user(), EventPayload::named("x"), 1);
        event.payload = None;
        assert_eq!(validate(&event), Err(ValidationError::MissingPayload));
    }

    #[test]
    fn test_update_whitespace_name_rejected() {
        let event =
            MutationEvent::update(EntityKind::Section, "a", user(), EventPayload::named("   "), 1);
        assert_eq!(validate(&event), Err(ValidationError::EmptyText));
    }

    #[test]
    fn test_update_without_name_ok() {
        // Structural updates carry no name at all — valid
        let event = MutationEvent::update(
            EntityKind::Section,
            "a",
            user(),
            EventPayload::at_order(2),
            1,
        );
        assert!(validate(&event).is_ok());
    }

    #[test]
    fn test_remove_tolerates_missing_payload() {
        let event = MutationEvent::remove(EntityKind::Section, "a", user(), 1);
        assert!(event.payload.is_none());
        assert!(validate(&event).is_ok());
    }

    #[test]
    fn test_reorder_requires_order_or_parent() {
        let event = MutationEvent::reorder(
            EntityKind::Section,
            "a",
            user(),
            EventPayload::default(),
            1,
        );
        assert_eq!(validate(&event), Err(ValidationError::MissingOrder));

        let event =
            MutationEvent::reorder(EntityKind::Section, "a", user(), EventPayload::at_order(0), 1);
        assert!(validate(&event).is_ok());

        // Reparent-only reorder is also valid
        let payload = EventPayload {
            parent_id: Some(None),
            ..EventPayload::default()
        };
        let event = MutationEvent::reorder(EntityKind::Section, "a", user(), payload, 1);
        assert!(validate(&event).is_ok());
    }

    #[test]
    fn test_error_display() {
        assert!(ValidationError::MissingIdentity.to_string().contains("id"));
        assert!(ValidationError::EmptyText.to_string().contains("empty"));
    }
}
