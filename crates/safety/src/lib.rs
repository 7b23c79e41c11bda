use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;
use winstick_core::whole_disk_name;

pub const TOKEN_PREFIX: &str = "WSK-";

#[derive(Debug, Clone, Default)]
pub struct SafetyContext {
    pub force_mode: bool,
    pub confirmation_token: Option<String>,
    pub allow_internal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allow,
    Deny(String),
}

pub fn require_confirmation_token() -> String {
    format!("{}{}", TOKEN_PREFIX, Uuid::new_v4())
}

pub fn can_erase_disk(ctx: &SafetyContext, target_is_internal: bool) -> SafetyDecision {
    if !ctx.force_mode {
        return SafetyDecision::Deny("Denied: destructive ops require force-mode".to_string());
    }

    let Some(token) = &ctx.confirmation_token else {
        return SafetyDecision::Deny("Denied: confirmation token missing".to_string());
    };
    let valid = token
        .strip_prefix(TOKEN_PREFIX)
        .is_some_and(|rest| Uuid::parse_str(rest).is_ok());
    if !valid {
        return SafetyDecision::Deny("Denied: invalid confirmation token".to_string());
    }

    if target_is_internal && !ctx.allow_internal {
        return SafetyDecision::Deny("Denied: target is an internal disk".to_string());
    }

    SafetyDecision::Allow
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("an erase is already running on {0}")]
    Busy(String),
}

/// Held for the duration of a destructive operation on one disk.
#[derive(Debug)]
pub struct DeviceLockGuard {
    disk: String,
    _guard: OwnedMutexGuard<()>,
}

impl DeviceLockGuard {
    pub fn disk(&self) -> &str {
        &self.disk
    }
}

/// Per-disk mutexes keyed on whole-disk name, so `/dev/rdisk4` and `disk4s1`
/// contend for the same lock.
#[derive(Debug, Clone, Default)]
pub struct DeviceLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, device: &str) -> Result<DeviceLockGuard, LockError> {
        let disk = whole_disk_name(device);
        let lock = {
            let mut map = match self.inner.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(map.entry(disk.clone()).or_default())
        };
        let guard = lock
            .try_lock_owned()
            .map_err(|_| LockError::Busy(disk.clone()))?;
        tracing::debug!(device = %disk, "device lock acquired");
        Ok(DeviceLockGuard {
            disk,
            _guard: guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denies_without_force() {
        let ctx = SafetyContext {
            force_mode: false,
            confirmation_token: None,
            allow_internal: false,
        };
        assert!(matches!(can_erase_disk(&ctx, false), SafetyDecision::Deny(_)));
    }

    #[test]
    fn denies_without_token() {
        let ctx = SafetyContext {
            force_mode: true,
            ..SafetyContext::default()
        };
        assert!(matches!(can_erase_disk(&ctx, false), SafetyDecision::Deny(_)));
    }

    #[test]
    fn denies_invalid_token() {
        let ctx = SafetyContext {
            force_mode: true,
            confirmation_token: Some("WSK-123".to_string()),
            allow_internal: false,
        };
        assert!(matches!(can_erase_disk(&ctx, false), SafetyDecision::Deny(_)));
    }

    #[test]
    fn allows_with_token() {
        let ctx = SafetyContext {
            force_mode: true,
            confirmation_token: Some(require_confirmation_token()),
            allow_internal: false,
        };
        assert_eq!(can_erase_disk(&ctx, false), SafetyDecision::Allow);
        assert!(matches!(can_erase_disk(&ctx, true), SafetyDecision::Deny(_)));

        let internal_ok = SafetyContext {
            allow_internal: true,
            ..ctx
        };
        assert_eq!(can_erase_disk(&internal_ok, true), SafetyDecision::Allow);
    }

    #[tokio::test]
    async fn second_lock_on_same_disk_is_busy() {
        let locks = DeviceLocks::new();
        let held = locks.try_acquire("/dev/rdisk4").unwrap();
        assert_eq!(held.disk(), "disk4");
        assert_eq!(
            locks.try_acquire("disk4s1").unwrap_err(),
            LockError::Busy("disk4".to_string())
        );
        assert!(locks.try_acquire("disk5").is_ok());
        drop(held);
        assert!(locks.try_acquire("disk4").is_ok());
    }
}
