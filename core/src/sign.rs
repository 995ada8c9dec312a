//! Sign records.
//!
//! Records are value-shaped and connected by ids: a [`Sign`] points at its
//! current [`SignEvent`] by id, events point back at the sign by id. Nothing
//! owns anything cyclically; the store is the arena.

use crate::ids::{
    ModificationId, OfferId, OrderId, PartId, ProductId, ProductItemId, ProfileId, SignEventId,
    SignId, UserId, VariationId,
};
use crate::gs1::MarkingCode;
use crate::status::SignStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rendered artifact of a code (barcode image, linked document).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeArtifact {
    /// Generated file name without extension.
    pub name: String,
    /// File extension, without the dot.
    pub extension: String,
    /// Whether the artifact has been pushed to the CDN.
    pub on_cdn: bool,
}

impl CodeArtifact {
    /// `name.extension`.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.name, self.extension)
    }
}

/// The marking code attached to a sign. Immutable once registered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignCode {
    /// Canonical bracketed GS1 string, unique system-wide.
    pub code: String,
    /// Rendered artifact, if one was produced.
    pub artifact: Option<CodeArtifact>,
}

impl SignCode {
    /// GTIN and serial of the code, `(01)…(21)…`.
    ///
    /// Two scans of one unit share this even when only one of them carries
    /// the crypto tail, so stores enforce uniqueness on it. A code that does
    /// not parse is its own identity.
    #[must_use]
    pub fn identity(&self) -> String {
        MarkingCode::parse(&self.code).map_or_else(|_| self.code.clone(), |code| code.short())
    }
}

/// A marking code and the pointer to its current event version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sign {
    /// Stable identity.
    pub id: SignId,
    /// The code itself.
    pub code: SignCode,
    /// The event version that is current.
    pub current_event: SignEventId,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// Catalogue identity a sign belongs to.
///
/// Optional components compare by exact equality: `None` only matches `None`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductKey {
    /// Product.
    pub product: ProductId,
    /// Offer.
    pub offer: Option<OfferId>,
    /// Variation.
    pub variation: Option<VariationId>,
    /// Modification.
    pub modification: Option<ModificationId>,
}

impl ProductKey {
    /// Key for a bare product.
    #[must_use]
    pub const fn new(product: ProductId) -> Self {
        Self {
            product,
            offer: None,
            variation: None,
            modification: None,
        }
    }

    /// Set the offer.
    #[must_use]
    pub const fn with_offer(mut self, offer: OfferId) -> Self {
        self.offer = Some(offer);
        self
    }

    /// Set the variation.
    #[must_use]
    pub const fn with_variation(mut self, variation: VariationId) -> Self {
        self.variation = Some(variation);
        self
    }

    /// Set the modification.
    #[must_use]
    pub const fn with_modification(mut self, modification: ModificationId) -> Self {
        self.modification = Some(modification);
        self
    }
}

/// Attributes that travel unchanged from event to event unless a command
/// explicitly overrides them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInvariable {
    /// Owner account.
    pub user: UserId,
    /// Owning profile.
    pub profile: ProfileId,
    /// Seller profile after a transfer.
    pub seller: Option<ProfileId>,
    /// Catalogue identity.
    pub product: ProductKey,
    /// Batch grouping token.
    pub part: Option<PartId>,
    /// Customs declaration number.
    pub declaration: Option<String>,
}

impl SignInvariable {
    /// Invariable for a freshly registered sign.
    #[must_use]
    pub const fn new(user: UserId, profile: ProfileId, product: ProductKey) -> Self {
        Self {
            user,
            profile,
            seller: None,
            product,
            part: None,
            declaration: None,
        }
    }
}

/// One immutable version of a sign's state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignEvent {
    /// Version id; also the optimistic-concurrency token.
    pub id: SignEventId,
    /// Owning sign.
    pub sign_id: SignId,
    /// Status in this version.
    pub status: SignStatus,
    /// Order this sign is reserved against (Process/Done only).
    pub order: Option<OrderId>,
    /// Order line item (Process/Done only).
    pub product_item: Option<ProductItemId>,
    /// Free text.
    pub comment: Option<String>,
    /// Carried attributes.
    pub invariable: SignInvariable,
    /// Set on a superseded version when a later version cancelled it back to `New`.
    pub cancelled: bool,
    /// Creation time of this version.
    pub created_at: DateTime<Utc>,
}

impl SignEvent {
    /// Whether this version is free for the given allocation key.
    #[must_use]
    pub fn is_allocatable_for(&self, key: &AllocationKey) -> bool {
        self.status == SignStatus::New
            && self.invariable.user == key.user
            && key.profile.is_none_or(|p| p == self.invariable.profile)
            && self.invariable.product == key.product
    }
}

/// Selection key for the allocator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationKey {
    /// Owner whose inventory is searched.
    pub user: UserId,
    /// Restrict to one profile; `None` searches every profile of the user.
    pub profile: Option<ProfileId>,
    /// Catalogue identity.
    pub product: ProductKey,
}

impl AllocationKey {
    /// Key over all profiles of a user.
    #[must_use]
    pub const fn new(user: UserId, product: ProductKey) -> Self {
        Self {
            user,
            profile: None,
            product,
        }
    }

    /// Restrict to a profile.
    #[must_use]
    pub const fn in_profile(mut self, profile: ProfileId) -> Self {
        self.profile = Some(profile);
        self
    }
}

/// Input for registering a new sign.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRegistration {
    /// Code as uploaded, bracketed or raw.
    pub code: String,
    /// Initial invariable.
    pub invariable: SignInvariable,
    /// Optional comment on the first event.
    pub comment: Option<String>,
}

/// Filter over **current** sign events.
///
/// All set criteria must match. Multiple statuses are OR-ed.
///
/// # Examples
///
/// ```
/// use marksign_core::ids::OrderId;
/// use marksign_core::sign::SignQuery;
/// use marksign_core::status::SignStatus;
///
/// let query = SignQuery::by_order(OrderId::new()).with_status(SignStatus::Done);
/// assert_eq!(query.statuses, vec![SignStatus::Done]);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignQuery {
    /// Order linkage.
    pub order: Option<OrderId>,
    /// Part grouping.
    pub part: Option<PartId>,
    /// Accepted statuses; empty accepts any.
    pub statuses: Vec<SignStatus>,
    /// Order line item.
    pub product_item: Option<ProductItemId>,
    /// Owner.
    pub user: Option<UserId>,
}

impl SignQuery {
    /// Signs linked to an order.
    #[must_use]
    pub fn by_order(order: OrderId) -> Self {
        Self {
            order: Some(order),
            ..Self::default()
        }
    }

    /// Signs of a batch.
    #[must_use]
    pub fn by_part(part: PartId) -> Self {
        Self {
            part: Some(part),
            ..Self::default()
        }
    }

    /// Accept an additional status.
    #[must_use]
    pub fn with_status(mut self, status: SignStatus) -> Self {
        if !self.statuses.contains(&status) {
            self.statuses.push(status);
        }
        self
    }

    /// Restrict to a line item.
    #[must_use]
    pub const fn for_product_item(mut self, item: ProductItemId) -> Self {
        self.product_item = Some(item);
        self
    }

    /// Restrict to an owner.
    #[must_use]
    pub const fn for_user(mut self, user: UserId) -> Self {
        self.user = Some(user);
        self
    }

    /// Whether a current event satisfies the query.
    #[must_use]
    pub fn matches(&self, event: &SignEvent) -> bool {
        self.order.is_none_or(|o| event.order == Some(o))
            && self.part.is_none_or(|p| event.invariable.part == Some(p))
            && (self.statuses.is_empty() || self.statuses.contains(&event.status))
            && self
                .product_item
                .is_none_or(|i| event.product_item == Some(i))
            && self.user.is_none_or(|u| event.invariable.user == u)
    }
}
