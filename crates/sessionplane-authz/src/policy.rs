//! Policy documents: `p` grants and `g` role memberships.

use crate::errors::{RbacError, RbacResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Domain granting access in every namespace.
pub const WILDCARD_DOMAIN: &str = "*";
/// Matches any resource or action in a `p` line.
pub const WILDCARD: &str = "*";
/// Every role name starts with this prefix.
pub const ROLE_PREFIX: &str = "role:";
/// Authenticated users appear in policy as `user:<provider>:<subject>`.
pub const USER_PREFIX: &str = "user:";

/// Whether `name` is a role (`role:<name>`).
pub fn is_role_name(name: &str) -> bool {
    name.strip_prefix(ROLE_PREFIX)
        .is_some_and(|rest| !rest.is_empty())
}

/// Whether `name` is a provider-qualified user principal.
pub fn is_user_principal(name: &str) -> bool {
    name.strip_prefix(USER_PREFIX)
        .and_then(|rest| rest.split_once(':'))
        .is_some_and(|(provider, subject)| !provider.is_empty() && !subject.is_empty())
}

/// Policy principal for `subject` as authenticated by `provider`.
///
/// Qualifying by provider keeps users of different backends apart and keeps
/// every user out of the role namespace, whatever name a backend hands out.
pub fn user_principal(provider: &str, subject: &str) -> String {
    format!("{USER_PREFIX}{provider}:{subject}")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyRule {
    pub subject: String,
    pub domain: String,
    pub resource: String,
    pub action: String,
}

/// `member` inherits every grant of `role`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupingRule {
    pub member: String,
    pub role: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub policies: Vec<PolicyRule>,
    pub groupings: Vec<GroupingRule>,
}

impl PolicyDocument {
    /// Parse the CSV policy format.
    ///
    /// # What it does
    /// Reads `p, <principal>, <domain>, <resource>, <action>` grants and
    /// `g, <member>, <role>` links. Blank lines and `#` comments are skipped.
    ///
    /// # Invariants
    /// - Grants name a `role:<name>` or a `user:<provider>:<subject>`
    ///   principal; bare names are rejected.
    /// - Every `g` line targets a role.
    ///
    /// # Errors
    /// - [`RbacError::InvalidPolicy`] with the 1-based line number for any
    ///   malformed or unknown line.
    pub fn parse(text: &str) -> RbacResult<Self> {
        let mut doc = Self::default();
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.trim();
            if content.is_empty() || content.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = content.split(',').map(str::trim).collect();
            if let Some(empty) = fields.iter().position(|f| f.is_empty()) {
                return Err(RbacError::InvalidPolicy {
                    line,
                    message: format!("field {} is empty", empty + 1),
                });
            }
            match fields.as_slice() {
                ["p", subject, domain, resource, action] => {
                    if !is_role_name(subject) && !is_user_principal(subject) {
                        return Err(RbacError::InvalidPolicy {
                            line,
                            message: format!(
                                "subject {subject:?} must be {ROLE_PREFIX}<name> or {USER_PREFIX}<provider>:<subject>"
                            ),
                        });
                    }
                    doc.policies.push(PolicyRule {
                        subject: subject.to_string(),
                        domain: domain.to_string(),
                        resource: resource.to_string(),
                        action: action.to_string(),
                    })
                }
                ["g", member, role] => {
                    if !is_role_name(member) && !is_user_principal(member) {
                        return Err(RbacError::InvalidPolicy {
                            line,
                            message: format!(
                                "member {member:?} must be {ROLE_PREFIX}<name> or {USER_PREFIX}<provider>:<subject>"
                            ),
                        });
                    }
                    if !is_role_name(role) {
                        return Err(RbacError::InvalidPolicy {
                            line,
                            message: format!("{role:?} is not a {ROLE_PREFIX}<name> role"),
                        });
                    }
                    doc.groupings.push(GroupingRule {
                        member: member.to_string(),
                        role: role.to_string(),
                    })
                }
                ["p", ..] => {
                    return Err(RbacError::InvalidPolicy {
                        line,
                        message: "p lines take subject, domain, resource, action".to_string(),
                    });
                }
                ["g", ..] => {
                    return Err(RbacError::InvalidPolicy {
                        line,
                        message: "g lines take member, role".to_string(),
                    });
                }
                [kind, ..] => {
                    return Err(RbacError::InvalidPolicy {
                        line,
                        message: format!("unknown rule type {kind:?}"),
                    });
                }
                [] => {}
            }
        }
        Ok(doc)
    }

    /// Read and merge every file, in order.
    ///
    /// # Errors
    /// - [`RbacError::NoSources`] when `paths` is empty.
    /// - [`RbacError::Io`] naming the first unreadable file.
    /// - [`RbacError::InvalidPolicy`] from the first file that fails to parse.
    pub async fn load_files(paths: &[PathBuf]) -> RbacResult<Self> {
        if paths.is_empty() {
            return Err(RbacError::NoSources);
        }
        let mut merged = Self::default();
        for path in paths {
            let text = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| RbacError::Io {
                    path: path.clone(),
                    source,
                })?;
            let doc = Self::parse(&text)?;
            merged.policies.extend(doc.policies);
            merged.groupings.extend(doc.groupings);
        }
        Ok(merged)
    }

    /// Roles reachable from `subject` through `g` lines, nearest first.
    pub fn roles_of(&self, subject: &str) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        let mut frontier = vec![subject.to_string()];
        while let Some(current) = frontier.pop() {
            for grouping in self.groupings.iter().filter(|g| g.member == current) {
                if grouping.role != subject && !found.contains(&grouping.role) {
                    found.push(grouping.role.clone());
                    frontier.push(grouping.role.clone());
                }
            }
        }
        found
    }
}
