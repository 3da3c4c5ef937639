//! Named groups: membership records and the rules for changing them.
//!
//! Only the creator may change membership, and only current members may
//! post. Group state is purely local — every member keeps their own copy,
//! seeded by GROUP_CREATE and patched by GROUP_UPDATE.

use crate::types::now;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub creator: String,
    pub members: HashSet<String>,
    pub last_updated: u64,
}

/// Outcome of applying a GROUP_UPDATE.
#[derive(Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied { added: Vec<String>, removed: Vec<String> },
    UnknownGroup,
    NotCreator,
}

/// Process-wide group map, keyed by GROUP_ID.
pub struct GroupTable {
    groups: Mutex<HashMap<String, Group>>,
}

impl GroupTable {
    pub fn new() -> Self {
        Self { groups: Mutex::new(HashMap::new()) }
    }

    /// Seed a group record from GROUP_CREATE (or the local create command).
    /// The creator is always a member regardless of the MEMBERS list.
    /// Returns false when the id already exists.
    pub fn create(&self, group_id: &str, name: &str, creator: &str, members: &[String]) -> bool {
        let mut groups = self.groups.lock().unwrap();
        if groups.contains_key(group_id) {
            return false;
        }
        let mut member_set: HashSet<String> = members.iter().cloned().collect();
        member_set.insert(creator.to_string());
        groups.insert(
            group_id.to_string(),
            Group {
                name: name.to_string(),
                creator: creator.to_string(),
                members: member_set,
                last_updated: now(),
            },
        );
        true
    }

    /// Apply a membership patch. `updater` must be the recorded creator.
    pub fn update(
        &self,
        group_id: &str,
        updater: &str,
        add: &[String],
        remove: &[String],
    ) -> UpdateOutcome {
        let mut groups = self.groups.lock().unwrap();
        let Some(group) = groups.get_mut(group_id) else {
            return UpdateOutcome::UnknownGroup;
        };
        if group.creator != updater {
            debug!("ignoring GROUP_UPDATE for {group_id} from non-creator {updater}");
            return UpdateOutcome::NotCreator;
        }

        let mut added = Vec::new();
        for member in add {
            if group.members.insert(member.clone()) {
                added.push(member.clone());
            }
        }
        let mut removed = Vec::new();
        for member in remove {
            // The creator cannot be removed, even by themselves.
            if member != &group.creator && group.members.remove(member) {
                removed.push(member.clone());
            }
        }
        group.last_updated = now();
        UpdateOutcome::Applied { added, removed }
    }

    pub fn get(&self, group_id: &str) -> Option<Group> {
        self.groups.lock().unwrap().get(group_id).cloned()
    }

    pub fn is_member(&self, group_id: &str, user_id: &str) -> bool {
        self.groups
            .lock()
            .unwrap()
            .get(group_id)
            .is_some_and(|g| g.members.contains(user_id))
    }

    /// Everyone in the group except `user_id` — the unicast fan-out set.
    pub fn other_members(&self, group_id: &str, user_id: &str) -> Vec<String> {
        self.groups
            .lock()
            .unwrap()
            .get(group_id)
            .map(|g| {
                g.members
                    .iter()
                    .filter(|m| m.as_str() != user_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `(group_id, name, member_count)` for every group containing the user.
    pub fn groups_of(&self, user_id: &str) -> Vec<(String, String, usize)> {
        let mut out: Vec<(String, String, usize)> = self
            .groups
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, g)| g.members.contains(user_id))
            .map(|(id, g)| (id.clone(), g.name.clone(), g.members.len()))
            .collect();
        out.sort();
        out
    }
}

impl Default for GroupTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREATOR: &str = "alice@10.0.0.1:50999";
    const BOB: &str = "bob@10.0.0.2:50999";
    const CAROL: &str = "carol@10.0.0.3:50999";

    fn table_with_group() -> GroupTable {
        let table = GroupTable::new();
        assert!(table.create("g1", "lunch crew", CREATOR, &[BOB.to_string()]));
        table
    }

    #[test]
    fn test_creator_is_always_a_member() {
        let table = GroupTable::new();
        table.create("g1", "x", CREATOR, &[]);
        assert!(table.is_member("g1", CREATOR));
    }

    #[test]
    fn test_duplicate_group_id_rejected() {
        let table = table_with_group();
        assert!(!table.create("g1", "again", BOB, &[]));
        assert_eq!(table.get("g1").unwrap().creator, CREATOR);
    }

    #[test]
    fn test_only_creator_may_update() {
        let table = table_with_group();
        assert_eq!(
            table.update("g1", BOB, &[CAROL.to_string()], &[]),
            UpdateOutcome::NotCreator
        );
        assert!(!table.is_member("g1", CAROL));

        let outcome = table.update("g1", CREATOR, &[CAROL.to_string()], &[BOB.to_string()]);
        assert_eq!(
            outcome,
            UpdateOutcome::Applied {
                added: vec![CAROL.to_string()],
                removed: vec![BOB.to_string()]
            }
        );
        assert!(table.is_member("g1", CAROL));
        assert!(!table.is_member("g1", BOB));
    }

    #[test]
    fn test_creator_cannot_be_removed() {
        let table = table_with_group();
        let outcome = table.update("g1", CREATOR, &[], &[CREATOR.to_string()]);
        assert_eq!(
            outcome,
            UpdateOutcome::Applied { added: vec![], removed: vec![] }
        );
        assert!(table.is_member("g1", CREATOR));
    }

    #[test]
    fn test_unknown_group_update() {
        let table = GroupTable::new();
        assert_eq!(
            table.update("nope", CREATOR, &[], &[]),
            UpdateOutcome::UnknownGroup
        );
    }

    #[test]
    fn test_fan_out_excludes_sender() {
        let table = table_with_group();
        let others = table.other_members("g1", CREATOR);
        assert_eq!(others, vec![BOB.to_string()]);
    }

    #[test]
    fn test_groups_of_user() {
        let table = table_with_group();
        table.create("g2", "second", BOB, &[]);
        let mine = table.groups_of(BOB);
        assert_eq!(mine.len(), 2);
        assert_eq!(table.groups_of(CAROL), vec![]);
    }
}
