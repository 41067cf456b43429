//! Group directory and authorization state machine.
//!
//! A group is a shared topic secret plus a replicated member roster with
//! owner/admin/member roles. Every roster transition is validated locally
//! and emitted as a signed control event so peers converge on the same
//! state. The directory persists encrypted under the storage key; per-group
//! message history lives in capped JSONL journals.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, ErrorCode, Result};
use crate::paths::{new_id, write_atomic, DataDir};
use crate::storage_key::StorageKeyCustodian;

// ─── Data model ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Member,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub pubkey: String,
    pub role: Role,
    pub joined_at: u64,
    pub last_seen_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub group_id: String,
    pub name: String,
    pub owner: String,
    /// Shared secret gating group-key derivation. Knowing it is membership
    /// in the cryptographic sense.
    pub topic: String,
    pub created_at: u64,
    pub members: HashMap<String, Member>,
    pub banned: HashSet<String>,
    /// pubkey → unmute time (unix seconds).
    pub muted: HashMap<String, u64>,
}

impl Group {
    pub fn has_admin_permission(&self, pubkey: &str) -> bool {
        pubkey == self.owner
            || self
                .members
                .get(pubkey)
                .map(|m| m.role == Role::Admin)
                .unwrap_or(false)
    }
}

/// Roster transition carried inside a signed control event. The event author
/// is the actor; the payload names only the remaining operands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GroupControlOp {
    Join,
    Leave,
    Kick { target: String },
    Ban { target: String },
    Mute { target: String, duration_s: u64 },
    SetAdmin { target: String, grant: bool },
    Transfer { new_owner: String },
}

const MIN_NAME_LEN: usize = 2;

// ─── Manager ─────────────────────────────────────────────────────────────────

pub struct GroupManager {
    paths: DataDir,
    groups: HashMap<String, Group>,
    history_limit: usize,
}

impl GroupManager {
    /// Load the encrypted group directory, or start empty.
    pub fn load(
        paths: &DataDir,
        custodian: &StorageKeyCustodian,
        history_limit: usize,
    ) -> Result<Self> {
        let path = paths.groups();
        paths.guard_inside(&path)?;

        let mut groups = HashMap::new();
        if path.exists() {
            let frame = std::fs::read_to_string(&path)?;
            let plain = custodian.decrypt_for_storage(frame.trim())?;
            let list: Vec<Group> = serde_json::from_slice(&plain).map_err(|e| {
                AgentError::wrap(ErrorCode::FileError, format!("corrupt group directory: {e}"))
            })?;
            for group in list {
                groups.insert(group.group_id.clone(), group);
            }
        }

        Ok(Self {
            paths: paths.clone(),
            groups,
            history_limit,
        })
    }

    /// Seal the directory back to disk.
    pub fn persist(&self, custodian: &StorageKeyCustodian) -> Result<()> {
        let mut list: Vec<&Group> = self.groups.values().collect();
        list.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        let frame = custodian.encrypt_for_storage(&serde_json::to_vec(&list)?)?;
        write_atomic(&self.paths.groups(), frame.as_bytes())
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn list_groups(&self) -> Vec<&Group> {
        let mut list: Vec<&Group> = self.groups.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub fn get(&self, group_id: &str) -> Result<&Group> {
        self.groups.get(group_id).ok_or_else(|| {
            AgentError::new(ErrorCode::GroupNotFound, format!("unknown group {group_id}"))
        })
    }

    pub fn get_members(&self, group_id: &str) -> Result<Vec<&Member>> {
        let group = self.get(group_id)?;
        let mut members: Vec<&Member> = group.members.values().collect();
        members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        Ok(members)
    }

    /// Whether `sender` may post to the group right now; the error names the
    /// specific reason when not.
    pub fn can_send(&self, group_id: &str, sender: &str) -> Result<()> {
        let group = self.get(group_id)?;
        if group.banned.contains(sender) {
            return Err(AgentError::new(
                ErrorCode::MemberBanned,
                format!("{sender} is banned from {group_id}"),
            ));
        }
        if !group.members.contains_key(sender) {
            return Err(AgentError::new(
                ErrorCode::MemberNotFound,
                format!("{sender} is not a member of {group_id}"),
            ));
        }
        if let Some(&until) = group.muted.get(sender) {
            if until > now_secs() {
                return Err(AgentError::new(
                    ErrorCode::MemberMuted,
                    format!("{sender} is muted until {until}"),
                ));
            }
        }
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Create a group owned by `owner`. Returns `(group_id, topic)`.
    pub fn create_group(&mut self, name: &str, owner: &str) -> Result<(String, String)> {
        if name.chars().count() < MIN_NAME_LEN {
            return Err(AgentError::new(
                ErrorCode::InvalidArgs,
                format!("group name must be at least {MIN_NAME_LEN} characters"),
            ));
        }

        let group_id = new_id();
        if self.groups.contains_key(&group_id) {
            return Err(AgentError::new(
                ErrorCode::GroupAlreadyExists,
                format!("group id collision: {group_id}"),
            ));
        }

        let topic = hex::encode(crate::crypto::random_bytes::<32>());
        let now = now_secs();
        let mut members = HashMap::new();
        members.insert(
            owner.to_string(),
            Member {
                pubkey: owner.to_string(),
                role: Role::Owner,
                joined_at: now,
                last_seen_at: now,
            },
        );

        self.groups.insert(
            group_id.clone(),
            Group {
                group_id: group_id.clone(),
                name: name.to_string(),
                owner: owner.to_string(),
                topic: topic.clone(),
                created_at: now,
                members,
                banned: HashSet::new(),
                muted: HashMap::new(),
            },
        );
        log::info!("created group {group_id} ({name})");
        Ok((group_id, topic))
    }

    /// Register a group learned out of band and enroll `member`. Idempotent
    /// when the group is already known with the same topic.
    pub fn join_group(&mut self, group_id: &str, topic: &str, member: &str) -> Result<()> {
        if topic.is_empty() || topic.chars().count() > 200 {
            return Err(AgentError::new(
                ErrorCode::InvalidArgs,
                "topic must be a non-empty string of at most 200 characters",
            ));
        }

        match self.groups.get_mut(group_id) {
            Some(group) => {
                if group.topic != topic {
                    return Err(AgentError::new(
                        ErrorCode::GroupAlreadyExists,
                        format!("group {group_id} is already known with a different topic"),
                    ));
                }
                if group.banned.contains(member) {
                    return Err(AgentError::new(
                        ErrorCode::MemberBanned,
                        format!("{member} is banned from {group_id}"),
                    ));
                }
                enroll(group, member, Role::Member);
            }
            None => {
                let now = now_secs();
                let mut members = HashMap::new();
                members.insert(
                    member.to_string(),
                    Member {
                        pubkey: member.to_string(),
                        role: Role::Member,
                        joined_at: now,
                        last_seen_at: now,
                    },
                );
                self.groups.insert(
                    group_id.to_string(),
                    Group {
                        group_id: group_id.to_string(),
                        name: group_id.to_string(),
                        // The owner is unknown until their control events
                        // replicate; joining by topic never grants ownership.
                        owner: String::new(),
                        topic: topic.to_string(),
                        created_at: now,
                        members,
                        banned: HashSet::new(),
                        muted: HashMap::new(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Forget a group locally.
    pub fn leave_group(&mut self, group_id: &str) -> Result<()> {
        self.groups.remove(group_id).ok_or_else(|| {
            AgentError::new(ErrorCode::GroupNotFound, format!("unknown group {group_id}"))
        })?;
        // The history journal goes with it.
        if let Ok(path) = self.paths.group_history(group_id) {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    // ── Role & moderation transitions ────────────────────────────────────────

    pub fn kick(&mut self, group_id: &str, actor: &str, target: &str) -> Result<GroupControlOp> {
        let group = self.get_mut(group_id)?;
        require_admin(group, actor)?;
        if target == group.owner {
            return Err(AgentError::new(
                ErrorCode::NotGroupOwner,
                "the owner cannot be kicked",
            ));
        }
        if group.members.remove(target).is_none() {
            return Err(AgentError::new(
                ErrorCode::MemberNotFound,
                format!("{target} is not a member of {group_id}"),
            ));
        }
        group.muted.remove(target);
        Ok(GroupControlOp::Kick { target: target.to_string() })
    }

    pub fn ban(&mut self, group_id: &str, actor: &str, target: &str) -> Result<GroupControlOp> {
        let group = self.get_mut(group_id)?;
        require_admin(group, actor)?;
        if target == group.owner {
            return Err(AgentError::new(
                ErrorCode::NotGroupOwner,
                "the owner cannot be banned",
            ));
        }
        group.members.remove(target);
        group.muted.remove(target);
        group.banned.insert(target.to_string());
        Ok(GroupControlOp::Ban { target: target.to_string() })
    }

    pub fn mute(
        &mut self,
        group_id: &str,
        actor: &str,
        target: &str,
        duration: Duration,
    ) -> Result<GroupControlOp> {
        let group = self.get_mut(group_id)?;
        require_admin(group, actor)?;
        if target == group.owner {
            return Err(AgentError::new(
                ErrorCode::NotGroupOwner,
                "the owner cannot be muted",
            ));
        }
        if !group.members.contains_key(target) {
            return Err(AgentError::new(
                ErrorCode::MemberNotFound,
                format!("{target} is not a member of {group_id}"),
            ));
        }
        group
            .muted
            .insert(target.to_string(), now_secs() + duration.as_secs());
        Ok(GroupControlOp::Mute {
            target: target.to_string(),
            duration_s: duration.as_secs(),
        })
    }

    pub fn set_admin(
        &mut self,
        group_id: &str,
        actor: &str,
        target: &str,
        grant: bool,
    ) -> Result<GroupControlOp> {
        let group = self.get_mut(group_id)?;
        if grant {
            require_admin(group, actor)?;
        } else if actor != group.owner {
            // Demotion is owner-only.
            return Err(AgentError::new(
                ErrorCode::NotGroupOwner,
                "only the owner may revoke admin",
            ));
        }
        if target == group.owner {
            return Err(AgentError::new(
                ErrorCode::NotGroupOwner,
                "the owner role cannot be changed here; transfer ownership instead",
            ));
        }
        let member = group.members.get_mut(target).ok_or_else(|| {
            AgentError::new(
                ErrorCode::MemberNotFound,
                format!("{target} is not a member of {group_id}"),
            )
        })?;
        member.role = if grant { Role::Admin } else { Role::Member };
        Ok(GroupControlOp::SetAdmin {
            target: target.to_string(),
            grant,
        })
    }

    pub fn transfer_ownership(
        &mut self,
        group_id: &str,
        actor: &str,
        new_owner: &str,
    ) -> Result<GroupControlOp> {
        let group = self.get_mut(group_id)?;
        if actor != group.owner {
            return Err(AgentError::new(
                ErrorCode::NotGroupOwner,
                "only the owner may transfer ownership",
            ));
        }
        if !group.members.contains_key(new_owner) {
            return Err(AgentError::new(
                ErrorCode::MemberNotFound,
                format!("{new_owner} is not a member of {group_id}"),
            ));
        }

        let old_owner = group.owner.clone();
        group.owner = new_owner.to_string();
        if let Some(m) = group.members.get_mut(new_owner) {
            m.role = Role::Owner;
        }
        if let Some(m) = group.members.get_mut(&old_owner) {
            m.role = Role::Admin;
        }
        Ok(GroupControlOp::Transfer { new_owner: new_owner.to_string() })
    }

    /// Record traffic from a member (updates `last_seen_at`).
    pub fn touch_member(&mut self, group_id: &str, pubkey: &str) {
        if let Some(group) = self.groups.get_mut(group_id) {
            if let Some(member) = group.members.get_mut(pubkey) {
                member.last_seen_at = now_secs();
            }
        }
    }

    // ── Replication ──────────────────────────────────────────────────────────

    /// Apply a control event authored by a remote peer. Returns `true` when
    /// it changed local state; events for unknown groups and events whose
    /// author lacks the required role are ignored.
    pub fn apply_control(
        &mut self,
        group_id: &str,
        author: &str,
        op: &GroupControlOp,
    ) -> Result<bool> {
        let Some(group) = self.groups.get_mut(group_id) else {
            return Ok(false);
        };

        match op {
            GroupControlOp::Join => {
                if group.banned.contains(author) {
                    return Ok(false);
                }
                Ok(enroll(group, author, Role::Member))
            }
            GroupControlOp::Leave => {
                if author == group.owner {
                    return Ok(false);
                }
                group.muted.remove(author);
                Ok(group.members.remove(author).is_some())
            }
            GroupControlOp::Kick { target } => {
                if !group.has_admin_permission(author) || *target == group.owner {
                    return Ok(false);
                }
                group.muted.remove(target);
                Ok(group.members.remove(target).is_some())
            }
            GroupControlOp::Ban { target } => {
                if !group.has_admin_permission(author) || *target == group.owner {
                    return Ok(false);
                }
                group.members.remove(target);
                group.muted.remove(target);
                Ok(group.banned.insert(target.clone()))
            }
            GroupControlOp::Mute { target, duration_s } => {
                if !group.has_admin_permission(author)
                    || *target == group.owner
                    || !group.members.contains_key(target)
                {
                    return Ok(false);
                }
                group.muted.insert(target.clone(), now_secs() + duration_s);
                Ok(true)
            }
            GroupControlOp::SetAdmin { target, grant } => {
                let allowed = if *grant {
                    group.has_admin_permission(author)
                } else {
                    author == group.owner
                };
                if !allowed || *target == group.owner {
                    return Ok(false);
                }
                match group.members.get_mut(target) {
                    Some(member) => {
                        member.role = if *grant { Role::Admin } else { Role::Member };
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            GroupControlOp::Transfer { new_owner } => {
                // An unreplicated owner (joined-by-topic group) accepts the
                // first transfer claim from the current owner only.
                if !group.owner.is_empty() && author != group.owner {
                    return Ok(false);
                }
                if !group.members.contains_key(new_owner) {
                    return Ok(false);
                }
                let old_owner = group.owner.clone();
                group.owner = new_owner.clone();
                if let Some(m) = group.members.get_mut(new_owner) {
                    m.role = Role::Owner;
                }
                if let Some(m) = group.members.get_mut(&old_owner) {
                    m.role = Role::Admin;
                }
                Ok(true)
            }
        }
    }

    // ── History ──────────────────────────────────────────────────────────────

    /// Append one record to the group's history journal, trimming to the
    /// configured cap via atomic replace.
    pub fn append_history(&self, group_id: &str, record: &serde_json::Value) -> Result<()> {
        let path = self.paths.group_history(group_id)?;

        let mut lines: Vec<String> = if path.exists() {
            std::fs::read_to_string(&path)?
                .lines()
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };
        lines.push(serde_json::to_string(record)?);
        if lines.len() > self.history_limit {
            let drop = lines.len() - self.history_limit;
            lines.drain(..drop);
        }
        let mut out = lines.join("\n");
        out.push('\n');
        write_atomic(&path, out.as_bytes())
    }

    pub fn read_history(&self, group_id: &str) -> Result<Vec<serde_json::Value>> {
        let path = self.paths.group_history(group_id)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for line in std::fs::read_to_string(&path)?.lines() {
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }

    fn get_mut(&mut self, group_id: &str) -> Result<&mut Group> {
        self.groups.get_mut(group_id).ok_or_else(|| {
            AgentError::new(ErrorCode::GroupNotFound, format!("unknown group {group_id}"))
        })
    }
}

fn require_admin(group: &Group, actor: &str) -> Result<()> {
    if !group.has_admin_permission(actor) {
        return Err(AgentError::new(
            ErrorCode::NotGroupOwner,
            format!("{actor} lacks admin permission in {}", group.group_id),
        ));
    }
    Ok(())
}

/// Add `pubkey` as a member if absent. Returns true when newly added.
fn enroll(group: &mut Group, pubkey: &str, role: Role) -> bool {
    if group.members.contains_key(pubkey) {
        return false;
    }
    let now = now_secs();
    group.members.insert(
        pubkey.to_string(),
        Member {
            pubkey: pubkey.to_string(),
            role,
            joined_at: now,
            last_seen_at: now,
        },
    );
    true
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
