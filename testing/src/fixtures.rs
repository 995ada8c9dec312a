//! Fixtures.

use marksign_core::ids::{ProductId, ProfileId, UserId};
use marksign_core::sign::{AllocationKey, ProductKey, SignInvariable, SignRegistration};

/// The code used in lifecycle scenarios.
pub const SCENARIO_CODE: &str = "(01)04600000000000(21)ABC123";

/// A distinct valid code per `n`.
#[must_use]
pub fn numbered_code(n: usize) -> String {
    format!("(01)04600000000000(21)SN{n:06}")
}

/// One owner with one profile and one product.
#[derive(Clone, Copy, Debug)]
pub struct Tenant {
    /// Owner.
    pub user: UserId,
    /// Profile.
    pub profile: ProfileId,
    /// Product.
    pub product: ProductKey,
}

impl Tenant {
    /// Fresh random tenant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            user: UserId::new(),
            profile: ProfileId::new(),
            product: ProductKey::new(ProductId::new()),
        }
    }

    /// Allocation key for the tenant's product.
    #[must_use]
    pub const fn key(&self) -> AllocationKey {
        AllocationKey::new(self.user, self.product)
    }

    /// Invariable for a fresh sign.
    #[must_use]
    pub const fn invariable(&self) -> SignInvariable {
        SignInvariable::new(self.user, self.profile, self.product)
    }

    /// Registration of `code`.
    #[must_use]
    pub fn registration(&self, code: &str) -> SignRegistration {
        SignRegistration {
            code: code.to_string(),
            invariable: self.invariable(),
            comment: None,
        }
    }
}

impl Default for Tenant {
    fn default() -> Self {
        Self::new()
    }
}
