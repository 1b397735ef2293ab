//! Group naming convention
//!
//! Providers keep no link from a keypair or security group back to the
//! nodes using it, so ownership is encoded in the name:
//!
//! - shared name (one per group and scope): `{prefix}-{group}`
//! - unique name (one per node): `{prefix}-{group}-{8 hex digits}`

use crate::error::{ComputeError, Result};

pub const DEFAULT_PREFIX: &str = "fleet";

const SUFFIX_LEN: usize = 8;

/// Decides which group, if any, a secondary resource belongs to
pub trait GroupOf: Send + Sync {
    fn group_of(&self, name: &str) -> Option<String>;
}

impl<F> GroupOf for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn group_of(&self, name: &str) -> Option<String> {
        self(name)
    }
}

/// Prefix based naming of group resources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupNamingConvention {
    prefix: String,
}

impl Default for GroupNamingConvention {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl GroupNamingConvention {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Reject group names that would make names ambiguous or invalid
    pub fn validate_group(&self, group: &str) -> Result<()> {
        if is_valid_group(group) {
            Ok(())
        } else {
            Err(ComputeError::InvalidGroupName(group.to_string()))
        }
    }

    /// Name of the keypair and security group shared by `group`
    pub fn shared_name_for_group(&self, group: &str) -> String {
        format!("{}-{}", self.prefix, group)
    }

    /// Fresh node name in `group`
    pub fn unique_name_for_group(&self, group: &str) -> String {
        format!("{}-{}-{:08x}", self.prefix, group, rand::random::<u32>())
    }

    /// Group encoded in a unique (node) name
    pub fn group_in_unique_name(&self, name: &str) -> Option<String> {
        let rest = name.strip_prefix(&self.prefix)?.strip_prefix('-')?;
        let (group, suffix) = rest.rsplit_once('-')?;
        let is_suffix = suffix.len() == SUFFIX_LEN && suffix.chars().all(|c| c.is_ascii_hexdigit());
        (is_suffix && is_valid_group(group)).then(|| group.to_string())
    }
}

impl GroupOf for GroupNamingConvention {
    /// Inverse of [`shared_name_for_group`](GroupNamingConvention::shared_name_for_group)
    fn group_of(&self, name: &str) -> Option<String> {
        let group = name.strip_prefix(&self.prefix)?.strip_prefix('-')?;
        is_valid_group(group).then(|| group.to_string())
    }
}

fn is_valid_group(group: &str) -> bool {
    !group.is_empty()
        && !group.starts_with('-')
        && !group.ends_with('-')
        && group
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_name_inverts() {
        let naming = GroupNamingConvention::default();
        let name = naming.shared_name_for_group("web-api");

        assert_eq!(name, "fleet-web-api");
        assert_eq!(naming.group_of(&name), Some("web-api".to_string()));
    }

    #[test]
    fn test_group_of_rejects_foreign_names() {
        let naming = GroupNamingConvention::new("fleet");

        assert_eq!(naming.group_of("default"), None);
        assert_eq!(naming.group_of("fleetweb"), None);
        assert_eq!(naming.group_of("fleet-"), None);
        assert_eq!(naming.group_of("fleet-Web"), None);
        assert_eq!(naming.group_of("other-web"), None);
    }

    #[test]
    fn test_unique_names_differ_and_carry_group() {
        let naming = GroupNamingConvention::default();
        let a = naming.unique_name_for_group("db");
        let b = naming.unique_name_for_group("db");

        assert_ne!(a, b);
        assert!(a.starts_with("fleet-db-"));
        assert_eq!(naming.group_in_unique_name(&a), Some("db".to_string()));
        assert_eq!(naming.group_in_unique_name("fleet-db"), None);
    }

    #[test]
    fn test_validate_group() {
        let naming = GroupNamingConvention::default();

        assert!(naming.validate_group("web-1").is_ok());
        assert!(naming.validate_group("").is_err());
        assert!(naming.validate_group("-web").is_err());
        assert!(naming.validate_group("web_1").is_err());
        assert!(naming.validate_group("Web").is_err());
    }

    #[test]
    fn test_closure_policy() {
        let policy = |name: &str| name.strip_suffix("-kp").map(str::to_string);

        assert_eq!(policy.group_of("g-kp"), Some("g".to_string()));
        assert_eq!(policy.group_of("g-sg"), None);
    }
}
