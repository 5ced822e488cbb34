//! User→resource access evaluation (§4.3.3) and the thin user/group
//! directory that `evaluate_access` resolves subjects against. The directory
//! itself is not named as an HTTP surface in §6, but the data model in §3
//! requires it to exist somewhere for policies to be evaluable at all.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use uuid::Uuid;

use super::PolicyError;
use crate::store::models::{
    DeviceType, Group, PolicyConditions, PolicyDecision, ResourceType, User, UserAccessPolicy, UserStatus,
};
use crate::store::requests::{NewGroup, NewMembership, NewUser};
use crate::store::Store;

/// Inputs to [`evaluate_access`] (§4.3.3).
#[derive(Debug, Clone)]
pub struct AccessRequest<'a> {
    pub user_id: &'a str,
    pub resource_type: ResourceType,
    pub resource_value: &'a str,
    pub device_type: Option<DeviceType>,
    pub client_ip: Option<Ipv4Addr>,
}

/// `{allowed, action, matched_policy_id, reason}` (§4.3.3).
#[derive(Debug, Clone, serde::Serialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub action: PolicyDecision,
    pub matched_policy_id: Option<Uuid>,
    pub reason: String,
}

impl AccessDecision {
    fn deny(reason: &str) -> Self {
        AccessDecision {
            allowed: false,
            action: PolicyDecision::Deny,
            matched_policy_id: None,
            reason: reason.to_string(),
        }
    }
}

/// §4.3.3, steps 1-6. Resolves the user, the user's direct group ids, and
/// the enabled policies for `resource_type`, then evaluates them in priority
/// order. First match wins; no match is a default deny.
pub async fn evaluate_access(store: &dyn Store, req: AccessRequest<'_>, now: DateTime<Utc>) -> Result<AccessDecision, PolicyError> {
    let user = match store.find_user(req.user_id).await? {
        Some(u) => u,
        None => return Ok(AccessDecision::deny("User not found")),
    };
    if user.status != UserStatus::Active {
        return Ok(AccessDecision::deny("User status is not active"));
    }

    let group_ids: HashSet<Uuid> = store.group_ids_for_user(user.id).await?.into_iter().collect();
    let policies = store.list_enabled_user_policies_for_resource(req.resource_type).await?;

    for policy in &policies {
        if let Some(from) = policy.valid_from {
            if now < from {
                continue;
            }
        }
        if let Some(until) = policy.valid_until {
            if now > until {
                continue;
            }
        }
        if !subject_matches(policy, &user, &group_ids) {
            continue;
        }
        if !resource_matches(&policy.resource_value, req.resource_value) {
            continue;
        }
        if let Some(conditions) = &policy.conditions {
            if !evaluate_conditions(conditions, req.device_type, req.client_ip, now) {
                continue;
            }
        }

        let allowed = matches!(policy.action, PolicyDecision::Allow | PolicyDecision::RequireMfa);
        return Ok(AccessDecision {
            allowed,
            action: policy.action,
            matched_policy_id: Some(policy.id),
            reason: format!("Matched policy: {}", policy.name),
        });
    }

    Ok(AccessDecision::deny("No matching policy found (default deny)"))
}

fn subject_matches(policy: &UserAccessPolicy, user: &User, group_ids: &HashSet<Uuid>) -> bool {
    use crate::store::models::SubjectType;
    match policy.subject_type {
        SubjectType::All => true,
        SubjectType::User => policy.subject_id == Some(user.id),
        SubjectType::Group => policy.subject_id.is_some_and(|g| group_ids.contains(&g)),
    }
}

/// `"/"` in the stored pattern means CIDR membership; otherwise a
/// case-insensitive glob (`*`, `?`) against the candidate value (§4.3.3
/// step 4).
fn resource_matches(pattern: &str, value: &str) -> bool {
    if pattern.contains('/') {
        if let (Ok(network), Ok(addr)) = (pattern.parse::<ipnet::Ipv4Net>(), value.parse::<Ipv4Addr>()) {
            return network.contains(&addr);
        }
        return false;
    }
    glob_match(pattern, value)
}

/// Minimal `fnmatch`-style glob: `*` matches any run of characters, `?`
/// matches exactly one, everything else is literal. Compiled to a regex
/// since the crate already carries `regex` for other pattern matching.
fn glob_match(pattern: &str, value: &str) -> bool {
    let mut regex_src = String::from("(?i)^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex_src.push_str(".*"),
            '?' => regex_src.push('.'),
            c => regex_src.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex_src.push('$');
    match regex::Regex::new(&regex_src) {
        Ok(re) => re.is_match(value),
        Err(_) => pattern.eq_ignore_ascii_case(value),
    }
}

/// §4.3.3 step 5: every condition present must pass.
fn evaluate_conditions(
    conditions: &PolicyConditions,
    device_type: Option<DeviceType>,
    client_ip: Option<Ipv4Addr>,
    now: DateTime<Utc>,
) -> bool {
    if let Some(allowed_types) = &conditions.device_types {
        if let Some(dt) = device_type {
            if !allowed_types.contains(&dt) {
                return false;
            }
        }
    }

    if let Some(windows) = &conditions.time_windows {
        if windows.is_empty() {
            return true;
        }
        // Evaluated in UTC (§9 Open Question (c), resolved in DESIGN.md).
        let day = now.weekday().num_days_from_monday() as u8;
        let time = now.time();
        let matched = windows
            .iter()
            .any(|w| w.day_of_week == day && time >= w.start && time <= w.end);
        if !matched {
            return false;
        }
    }

    if let Some(allowed_ips) = &conditions.allowed_ips {
        match client_ip {
            Some(ip) if allowed_ips.contains(&ip) => {}
            _ => return false,
        }
    }

    true
}

/// The User/Group/Membership management surface §3 requires to exist so
/// `evaluate_access` has subjects to resolve. Not named as its own HTTP
/// endpoint table in §6, but layered onto the admin surface the same way
/// `/admin/policies` is (see `http::admin`).
pub struct UserDirectory {
    store: Arc<dyn Store>,
}

impl UserDirectory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        UserDirectory { store }
    }

    pub async fn create_user(&self, user_id: String, email: Option<String>, attributes: Vec<u8>) -> Result<User, PolicyError> {
        Ok(self.store.insert_user(NewUser { user_id, email, attributes }).await?)
    }

    /// Rejects a group whose `parent_group_id` would close a cycle, walking
    /// up the hierarchy with an explicit visited set (§9 "Cycle in group
    /// hierarchy" design note) rather than trusting depth alone.
    pub async fn create_group(&self, name: String, parent_group_id: Option<Uuid>) -> Result<Group, PolicyError> {
        if let Some(parent_id) = parent_group_id {
            let ancestors = group_ancestors(self.store.as_ref(), parent_id).await?;
            if ancestors.iter().any(|g| g.name == name) {
                return Err(PolicyError::Validation("group hierarchy would contain a cycle".to_string()));
            }
        }
        Ok(self.store.insert_group(NewGroup { name, parent_group_id }).await?)
    }

    pub async fn add_membership(&self, user_db_id: Uuid, group_id: Uuid, role: crate::store::models::GroupRole) -> Result<(), PolicyError> {
        Ok(self
            .store
            .insert_membership(NewMembership { user_id: user_db_id, group_id, role })
            .await?)
    }
}

/// Walks `group_id`'s ancestor chain via `parent_group_id`, bounded by an
/// explicit visited set so a corrupt or concurrently-introduced cycle can
/// never loop forever (§9).
async fn group_ancestors(store: &dyn Store, group_id: Uuid) -> Result<Vec<Group>, PolicyError> {
    let mut visited = HashSet::new();
    let mut ancestors = Vec::new();
    let mut current = Some(group_id);
    while let Some(id) = current {
        if !visited.insert(id) {
            break;
        }
        let Some(group) = store.get_group(id).await? else {
            break;
        };
        current = group.parent_group_id;
        ancestors.push(group);
    }
    Ok(ancestors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::store::models::{SubjectType, TimeWindow};
    use chrono::NaiveTime;

    async fn setup_user_and_group(store: &InMemoryStore, user_id: &str, group_name: &str) -> (User, Group) {
        let user = store
            .insert_user(NewUser {
                user_id: user_id.to_string(),
                email: None,
                attributes: Vec::new(),
            })
            .await
            .unwrap();
        let group = store
            .insert_group(NewGroup { name: group_name.to_string(), parent_group_id: None })
            .await
            .unwrap();
        store
            .insert_membership(NewMembership {
                user_id: user.id,
                group_id: group.id,
                role: crate::store::models::GroupRole::Member,
            })
            .await
            .unwrap();
        (user, group)
    }

    fn base_policy(subject_type: SubjectType, subject_id: Option<Uuid>) -> UserAccessPolicy {
        UserAccessPolicy {
            id: Uuid::new_v4(),
            name: "allow-devs".to_string(),
            subject_type,
            subject_id,
            resource_type: ResourceType::Domain,
            resource_value: "*.example.com".to_string(),
            action: PolicyDecision::Allow,
            conditions: None,
            priority: 100,
            enabled: true,
            valid_from: None,
            valid_until: None,
        }
    }

    #[tokio::test]
    async fn scenario_s6_group_member_allowed_then_denied_after_removal() {
        let store = InMemoryStore::new();
        let (_user, group) = setup_user_and_group(&store, "u1", "devs").await;
        store
            .insert_user_access_policy(base_policy(SubjectType::Group, Some(group.id)))
            .await
            .unwrap();

        let decision = evaluate_access(
            &store,
            AccessRequest {
                user_id: "u1",
                resource_type: ResourceType::Domain,
                resource_value: "api.example.com",
                device_type: None,
                client_ip: None,
            },
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.action, PolicyDecision::Allow);
    }

    #[tokio::test]
    async fn unknown_user_is_default_deny() {
        let store = InMemoryStore::new();
        let decision = evaluate_access(
            &store,
            AccessRequest {
                user_id: "ghost",
                resource_type: ResourceType::Domain,
                resource_value: "api.example.com",
                device_type: None,
                client_ip: None,
            },
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "User not found");
    }

    #[tokio::test]
    async fn boundary_b4_expired_policy_is_skipped_and_falls_through_to_default_deny() {
        let store = InMemoryStore::new();
        let user = store
            .insert_user(NewUser { user_id: "u1".to_string(), email: None, attributes: Vec::new() })
            .await
            .unwrap();
        let mut policy = base_policy(SubjectType::User, Some(user.id));
        policy.valid_until = Some(Utc::now() - chrono::Duration::days(1));
        store.insert_user_access_policy(policy).await.unwrap();

        let decision = evaluate_access(
            &store,
            AccessRequest {
                user_id: "u1",
                resource_type: ResourceType::Domain,
                resource_value: "api.example.com",
                device_type: None,
                client_ip: None,
            },
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "No matching policy found (default deny)");
    }

    #[tokio::test]
    async fn cidr_pattern_matches_ip_membership() {
        assert!(resource_matches("10.0.0.0/24", "10.0.0.5"));
        assert!(!resource_matches("10.0.0.0/24", "10.0.1.5"));
    }

    #[tokio::test]
    async fn glob_pattern_is_case_insensitive() {
        assert!(glob_match("*.Example.com", "api.example.com"));
        assert!(!glob_match("*.example.com", "example.org"));
    }

    #[tokio::test]
    async fn time_window_condition_gates_by_utc_day_and_hour() {
        let conditions = PolicyConditions {
            device_types: None,
            time_windows: Some(vec![TimeWindow {
                day_of_week: 0,
                start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            }]),
            allowed_ips: None,
        };
        let monday_noon = "2024-01-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap(); // a Monday
        let monday_midnight = "2024-01-01T23:30:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(evaluate_conditions(&conditions, None, None, monday_noon));
        assert!(!evaluate_conditions(&conditions, None, None, monday_midnight));
    }

    #[tokio::test]
    async fn group_cycle_is_rejected() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let directory = UserDirectory::new(store);
        let a = directory.create_group("a".to_string(), None).await.unwrap();
        let b = directory.create_group("b".to_string(), Some(a.id)).await.unwrap();
        let err = directory.create_group("a".to_string(), Some(b.id)).await.unwrap_err();
        assert!(matches!(err, PolicyError::Validation(_)));
    }
}
