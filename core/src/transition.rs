//! Transition planning.
//!
//! [`plan`] is the pure half of the transition engine: given the current event
//! of a sign and a [`SignCommand`], it either produces the [`Transition`] to
//! commit or a [`Violation`]. It performs no I/O and never partially applies.
//!
//! [`admit`] does the same for a registration, producing the sign and its first
//! `New` event.

use crate::gs1::{CodeParseError, MarkingCode};
use crate::ids::{OrderId, PartId, ProductItemId, ProfileId, SignEventId, SignId};
use crate::sign::{Sign, SignCode, SignEvent, SignInvariable, SignRegistration};
use crate::status::SignStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted comment, in characters.
pub const MAX_COMMENT_LEN: usize = 1000;

/// Why a command or registration was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Not in the legal-transition table.
    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Current status.
        from: SignStatus,
        /// Requested status.
        to: SignStatus,
    },

    /// Amendments are not accepted once a sign is terminal.
    #[error("Cannot amend a sign in terminal status {0}")]
    AmendTerminal(SignStatus),

    /// Target status needs an order.
    #[error("Order is required")]
    MissingOrder,

    /// Target status needs an order line item.
    #[error("Product item is required")]
    MissingProductItem,

    /// Target status needs a part token.
    #[error("Part is required for {0}")]
    MissingPart(SignStatus),

    /// Order linkage supplied where the target status does not carry one.
    #[error("Order linkage is not allowed for {0}")]
    UnexpectedOrderLinkage(SignStatus),

    /// Order linkage in the command disagrees with the reserved one.
    #[error("Order linkage does not match the reservation")]
    OrderMismatch,

    /// A reference is the nil id.
    #[error("Reference '{0}' is nil")]
    NilReference(&'static str),

    /// Declaration number present but blank.
    #[error("Declaration number is blank")]
    BlankDeclaration,

    /// Comment exceeds [`MAX_COMMENT_LEN`].
    #[error("Comment is {len} characters, limit is {max}")]
    CommentTooLong {
        /// Actual length.
        len: usize,
        /// Limit.
        max: usize,
    },

    /// Code is already registered.
    #[error("Code already registered: {0}")]
    DuplicateCode(String),

    /// Code does not follow the GS1 grammar.
    #[error("Invalid code: {0}")]
    InvalidCode(#[from] CodeParseError),
}

/// A requested state change.
///
/// `target: None` is an amendment: the status is kept and only the carried
/// attributes change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignCommand {
    /// Requested status.
    pub target: Option<SignStatus>,
    /// Order linkage.
    pub order: Option<OrderId>,
    /// Line-item linkage.
    pub product_item: Option<ProductItemId>,
    /// Part override.
    pub part: Option<PartId>,
    /// Comment for the new version.
    pub comment: Option<String>,
    /// Seller override.
    pub seller: Option<ProfileId>,
    /// Declaration override.
    pub declaration: Option<String>,
}

impl SignCommand {
    const fn to(target: SignStatus) -> Self {
        Self {
            target: Some(target),
            order: None,
            product_item: None,
            part: None,
            comment: None,
            seller: None,
            declaration: None,
        }
    }

    /// Reserve against an order line item.
    #[must_use]
    pub const fn process(order: OrderId, product_item: ProductItemId, part: PartId) -> Self {
        let mut command = Self::to(SignStatus::Process);
        command.order = Some(order);
        command.product_item = Some(product_item);
        command.part = Some(part);
        command
    }

    /// Mark the reserved line fulfilled.
    #[must_use]
    pub const fn done() -> Self {
        Self::to(SignStatus::Done)
    }

    /// Roll back to `New`, dropping order linkage.
    #[must_use]
    pub const fn cancel() -> Self {
        Self::to(SignStatus::New)
    }

    /// Write off under a batch part.
    #[must_use]
    pub const fn decommission(part: PartId) -> Self {
        let mut command = Self::to(SignStatus::Decommission);
        command.part = Some(part);
        command
    }

    /// Stage returned stock.
    #[must_use]
    pub const fn return_stock() -> Self {
        Self::to(SignStatus::Return)
    }

    /// Administrative removal.
    #[must_use]
    pub const fn delete() -> Self {
        Self::to(SignStatus::Delete)
    }

    /// Mark unrecoverable, recording why.
    #[must_use]
    pub fn error(comment: impl Into<String>) -> Self {
        Self::to(SignStatus::Error).with_comment(comment)
    }

    /// Keep the status, change carried attributes.
    #[must_use]
    pub fn amend() -> Self {
        Self::default()
    }

    /// Set the comment.
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Set the part.
    #[must_use]
    pub const fn with_part(mut self, part: PartId) -> Self {
        self.part = Some(part);
        self
    }

    /// Set the seller.
    #[must_use]
    pub const fn with_seller(mut self, seller: ProfileId) -> Self {
        self.seller = Some(seller);
        self
    }

    /// Set the declaration number.
    #[must_use]
    pub fn with_declaration(mut self, declaration: impl Into<String>) -> Self {
        self.declaration = Some(declaration.into());
        self
    }

    /// Set order linkage explicitly.
    #[must_use]
    pub const fn with_order(mut self, order: OrderId, product_item: ProductItemId) -> Self {
        self.order = Some(order);
        self.product_item = Some(product_item);
        self
    }
}

/// A planned, validated state change ready to be committed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Sign being moved.
    pub sign_id: SignId,
    /// Event that must still be current at commit time.
    pub expected: SignEventId,
    /// New version.
    pub event: SignEvent,
    /// Flag the superseded version as cancelled in the same commit.
    pub cancel_previous: bool,
}

/// Plan a transition from `current` according to `command`.
///
/// # Errors
///
/// Returns the first [`Violation`] found. Nothing is produced on error.
pub fn plan(
    current: &SignEvent,
    command: SignCommand,
    new_event: SignEventId,
    now: DateTime<Utc>,
) -> Result<Transition, Violation> {
    let from = current.status;
    let to = command.target.unwrap_or(from);
    let amending = command.target.is_none();

    if amending {
        if from.is_terminal() {
            return Err(Violation::AmendTerminal(from));
        }
        if command.order.is_some() || command.product_item.is_some() {
            return Err(Violation::UnexpectedOrderLinkage(from));
        }
    } else if !from.can_transition_to(to) {
        return Err(Violation::IllegalTransition { from, to });
    }

    let (order, product_item) = if amending {
        (current.order, current.product_item)
    } else {
        order_linkage(current, &command, to)?
    };

    let part = match (amending, to) {
        (false, SignStatus::Process | SignStatus::Decommission) => {
            Some(command.part.ok_or(Violation::MissingPart(to))?)
        },
        _ => command.part.or(current.invariable.part),
    };

    let invariable = SignInvariable {
        part,
        seller: command.seller.or(current.invariable.seller),
        declaration: command
            .declaration
            .or_else(|| current.invariable.declaration.clone()),
        ..current.invariable.clone()
    };
    validate_invariable(&invariable)?;

    let comment = if amending {
        command.comment.or_else(|| current.comment.clone())
    } else {
        command.comment
    };
    validate_comment(comment.as_deref())?;

    Ok(Transition {
        sign_id: current.sign_id,
        expected: current.id,
        event: SignEvent {
            id: new_event,
            sign_id: current.sign_id,
            status: to,
            order,
            product_item,
            comment,
            invariable,
            cancelled: false,
            created_at: now,
        },
        cancel_previous: to == SignStatus::New && from != SignStatus::New,
    })
}

fn order_linkage(
    current: &SignEvent,
    command: &SignCommand,
    to: SignStatus,
) -> Result<(Option<OrderId>, Option<ProductItemId>), Violation> {
    match to {
        SignStatus::Process => {
            let order = command.order.ok_or(Violation::MissingOrder)?;
            let item = command.product_item.ok_or(Violation::MissingProductItem)?;
            Ok((Some(order), Some(item)))
        },
        SignStatus::Done => {
            let order = inherit(command.order, current.order)?.ok_or(Violation::MissingOrder)?;
            let item = inherit(command.product_item, current.product_item)?
                .ok_or(Violation::MissingProductItem)?;
            Ok((Some(order), Some(item)))
        },
        _ => {
            if command.order.is_some() || command.product_item.is_some() {
                return Err(Violation::UnexpectedOrderLinkage(to));
            }
            Ok((None, None))
        },
    }
}

fn inherit<T: PartialEq>(requested: Option<T>, reserved: Option<T>) -> Result<Option<T>, Violation> {
    match (requested, reserved) {
        (Some(r), Some(c)) if r != c => Err(Violation::OrderMismatch),
        (requested, reserved) => Ok(reserved.or(requested)),
    }
}

/// Check the integrity of a carried-attribute record.
///
/// # Errors
///
/// Returns [`Violation::NilReference`] or [`Violation::BlankDeclaration`].
pub fn validate_invariable(invariable: &SignInvariable) -> Result<(), Violation> {
    if invariable.user.is_nil() {
        return Err(Violation::NilReference("user"));
    }
    if invariable.profile.is_nil() {
        return Err(Violation::NilReference("profile"));
    }
    if invariable.product.product.is_nil() {
        return Err(Violation::NilReference("product"));
    }
    if invariable.seller.is_some_and(|s| s.is_nil()) {
        return Err(Violation::NilReference("seller"));
    }
    if invariable.part.is_some_and(|p| p.is_nil()) {
        return Err(Violation::NilReference("part"));
    }
    if invariable
        .declaration
        .as_deref()
        .is_some_and(|d| d.trim().is_empty())
    {
        return Err(Violation::BlankDeclaration);
    }
    Ok(())
}

fn validate_comment(comment: Option<&str>) -> Result<(), Violation> {
    let len = comment.map_or(0, |c| c.chars().count());
    if len > MAX_COMMENT_LEN {
        return Err(Violation::CommentTooLong {
            len,
            max: MAX_COMMENT_LEN,
        });
    }
    Ok(())
}

/// Build the records for a new sign.
///
/// The code is parsed and stored in canonical bracketed form. The first event
/// is `New` with no order linkage.
///
/// # Errors
///
/// Returns [`Violation::InvalidCode`] for a malformed code, or an invariable or
/// comment violation.
pub fn admit(
    registration: SignRegistration,
    sign_id: SignId,
    event_id: SignEventId,
    now: DateTime<Utc>,
) -> Result<(Sign, SignEvent), Violation> {
    let code = MarkingCode::parse(&registration.code)?;
    validate_invariable(&registration.invariable)?;
    validate_comment(registration.comment.as_deref())?;

    let sign = Sign {
        id: sign_id,
        code: SignCode {
            code: code.to_string(),
            artifact: None,
        },
        current_event: event_id,
        created_at: now,
    };
    let event = SignEvent {
        id: event_id,
        sign_id,
        status: SignStatus::New,
        order: None,
        product_item: None,
        comment: registration.comment,
        invariable: registration.invariable,
        cancelled: false,
        created_at: now,
    };
    Ok((sign, event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ProductId, UserId};
    use crate::sign::ProductKey;

    fn new_event() -> SignEvent {
        SignEvent {
            id: SignEventId::new(),
            sign_id: SignId::new(),
            status: SignStatus::New,
            order: None,
            product_item: None,
            comment: None,
            invariable: SignInvariable::new(
                UserId::new(),
                ProfileId::new(),
                ProductKey::new(ProductId::new()),
            ),
            cancelled: false,
            created_at: Utc::now(),
        }
    }

    fn step(current: &SignEvent, command: SignCommand) -> Result<Transition, Violation> {
        plan(current, command, SignEventId::new(), Utc::now())
    }

    #[test]
    fn reserve_fulfil_cancel_round_trip() {
        let start = new_event();
        let (order, item, part) = (OrderId::new(), ProductItemId::new(), PartId::new());

        let reserved = step(&start, SignCommand::process(order, item, part));
        assert!(reserved.is_ok());
        let Ok(reserved) = reserved else { return };
        assert_eq!(reserved.expected, start.id);
        assert_eq!(reserved.event.order, Some(order));
        assert_eq!(reserved.event.invariable.part, Some(part));
        assert!(!reserved.cancel_previous);

        let Ok(done) = step(&reserved.event, SignCommand::done()) else {
            unreachable!("done must be planned")
        };
        assert_eq!(done.event.order, Some(order));
        assert_eq!(done.event.product_item, Some(item));

        let Ok(cancelled) = step(&done.event, SignCommand::cancel()) else {
            unreachable!("cancel must be planned")
        };
        assert_eq!(cancelled.event.status, SignStatus::New);
        assert_eq!(cancelled.event.order, None);
        assert_eq!(cancelled.event.product_item, None);
        assert!(cancelled.cancel_previous);
        assert_eq!(cancelled.event.invariable.part, Some(part));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        assert_eq!(
            step(&new_event(), SignCommand::done()),
            Err(Violation::IllegalTransition {
                from: SignStatus::New,
                to: SignStatus::Done
            })
        );
    }

    #[test]
    fn process_requires_complete_linkage() {
        let mut command = SignCommand::process(OrderId::new(), ProductItemId::new(), PartId::new());
        command.product_item = None;
        assert_eq!(
            step(&new_event(), command),
            Err(Violation::MissingProductItem)
        );

        let mut command = SignCommand::process(OrderId::new(), ProductItemId::new(), PartId::new());
        command.part = None;
        assert_eq!(
            step(&new_event(), command),
            Err(Violation::MissingPart(SignStatus::Process))
        );
    }

    #[test]
    fn done_rejects_a_different_order() {
        let Ok(reserved) = step(
            &new_event(),
            SignCommand::process(OrderId::new(), ProductItemId::new(), PartId::new()),
        ) else {
            unreachable!("process must be planned")
        };
        let command = SignCommand::done().with_order(OrderId::new(), ProductItemId::new());
        assert_eq!(step(&reserved.event, command), Err(Violation::OrderMismatch));
    }

    #[test]
    fn return_clears_linkage_and_rejects_explicit_linkage() {
        let Ok(reserved) = step(
            &new_event(),
            SignCommand::process(OrderId::new(), ProductItemId::new(), PartId::new()),
        ) else {
            unreachable!("process must be planned")
        };

        let Ok(returned) = step(&reserved.event, SignCommand::return_stock()) else {
            unreachable!("return must be planned")
        };
        assert_eq!(returned.event.order, None);
        assert!(!returned.cancel_previous);

        let explicit = SignCommand::return_stock().with_order(OrderId::new(), ProductItemId::new());
        assert_eq!(
            step(&reserved.event, explicit),
            Err(Violation::UnexpectedOrderLinkage(SignStatus::Return))
        );
    }

    #[test]
    fn decommission_stamps_the_batch_part() {
        let part = PartId::new();
        let Ok(planned) = step(&new_event(), SignCommand::decommission(part)) else {
            unreachable!("decommission must be planned")
        };
        assert_eq!(planned.event.invariable.part, Some(part));

        let mut without_part = SignCommand::decommission(part);
        without_part.part = None;
        assert_eq!(
            step(&new_event(), without_part),
            Err(Violation::MissingPart(SignStatus::Decommission))
        );
    }

    #[test]
    fn amendment_keeps_status_and_linkage() {
        let order = OrderId::new();
        let Ok(reserved) = step(
            &new_event(),
            SignCommand::process(order, ProductItemId::new(), PartId::new()),
        ) else {
            unreachable!("process must be planned")
        };

        let part = PartId::new();
        let Ok(amended) = step(
            &reserved.event,
            SignCommand::amend().with_part(part).with_declaration("10702030/010125/0000001"),
        ) else {
            unreachable!("amend must be planned")
        };
        assert_eq!(amended.event.status, SignStatus::Process);
        assert_eq!(amended.event.order, Some(order));
        assert_eq!(amended.event.invariable.part, Some(part));
        assert!(amended.event.invariable.declaration.is_some());
        assert!(!amended.cancel_previous);
    }

    #[test]
    fn amendment_cannot_touch_linkage_or_terminal_signs() {
        let linked = SignCommand::amend().with_order(OrderId::new(), ProductItemId::new());
        assert_eq!(
            step(&new_event(), linked),
            Err(Violation::UnexpectedOrderLinkage(SignStatus::New))
        );

        let Ok(deleted) = step(&new_event(), SignCommand::delete()) else {
            unreachable!("delete must be planned")
        };
        assert_eq!(
            step(&deleted.event, SignCommand::amend().with_part(PartId::new())),
            Err(Violation::AmendTerminal(SignStatus::Delete))
        );
        assert!(matches!(
            step(&deleted.event, SignCommand::cancel()),
            Err(Violation::IllegalTransition { .. })
        ));
    }

    #[test]
    fn invariable_checks() {
        let blank = SignCommand::amend().with_declaration("   ");
        assert_eq!(step(&new_event(), blank), Err(Violation::BlankDeclaration));

        let long = SignCommand::error("x".repeat(MAX_COMMENT_LEN + 1));
        assert!(matches!(
            step(&new_event(), long),
            Err(Violation::CommentTooLong { .. })
        ));

        let nil_seller = SignCommand::amend().with_seller(ProfileId::from_uuid(uuid::Uuid::nil()));
        assert_eq!(
            step(&new_event(), nil_seller),
            Err(Violation::NilReference("seller"))
        );
    }

    #[test]
    fn admit_canonicalises_the_code() {
        let template = new_event();
        let registration = SignRegistration {
            code: "]d2010460000000000021ABC123".to_string(),
            invariable: template.invariable,
            comment: None,
        };
        let Ok((sign, event)) = admit(registration, SignId::new(), SignEventId::new(), Utc::now())
        else {
            unreachable!("registration must be admitted")
        };
        assert_eq!(sign.code.code, "(01)04600000000000(21)ABC123");
        assert_eq!(sign.current_event, event.id);
        assert_eq!(event.status, SignStatus::New);
    }

    #[test]
    fn admit_rejects_bad_codes() {
        let template = new_event();
        let registration = SignRegistration {
            code: "(01)123".to_string(),
            invariable: template.invariable,
            comment: None,
        };
        assert!(matches!(
            admit(registration, SignId::new(), SignEventId::new(), Utc::now()),
            Err(Violation::InvalidCode(_))
        ));
    }
}
