//! Device security state.

use common::errors::Error;

use crate::keys::KeyVault;

/// The signing device: a key vault gated by a lock flag.
///
/// Handlers must refuse to touch key material while the device is locked.
pub struct Device {
    vault: KeyVault,
    unlocked: bool,
}

impl Device {
    /// A freshly provisioned device starts locked.
    pub fn new(vault: KeyVault) -> Self {
        Self {
            vault,
            unlocked: false,
        }
    }

    pub fn unlock(&mut self) {
        self.unlocked = true;
    }

    pub fn lock(&mut self) {
        self.unlocked = false;
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    /// Access to the key vault, refused while locked.
    pub fn vault(&self) -> Result<&KeyVault, Error> {
        if self.unlocked {
            Ok(&self.vault)
        } else {
            Err(Error::DeviceLocked)
        }
    }
}
