use crate::commitlog::Index;
use std::fmt;

/// ReplicaId identifies a member of the cluster.
#[derive(Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        ReplicaId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Active members vote and may lead. Passive members only receive replicated entries.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MemberType {
    Active,
    Passive,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Member {
    pub id: ReplicaId,
    pub member_type: MemberType,
}

impl Member {
    pub fn new(id: ReplicaId, member_type: MemberType) -> Self {
        Member { id, member_type }
    }

    pub fn is_active(&self) -> bool {
        self.member_type == MemberType::Active
    }
}

/// A change to the membership, as requested through the ConfigurationChange RPC.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum ConfigurationChange {
    Join { member: ReplicaId, member_type: MemberType },
    Leave(ReplicaId),
    Promote(ReplicaId),
    Demote(ReplicaId),
}

impl ConfigurationChange {
    pub(crate) fn member(&self) -> &ReplicaId {
        match self {
            ConfigurationChange::Join { member, .. } => member,
            ConfigurationChange::Leave(member) => member,
            ConfigurationChange::Promote(member) => member,
            ConfigurationChange::Demote(member) => member,
        }
    }
}

/// ClusterConfiguration is an ordered set of members, versioned by the index of the log entry
/// that introduced it. A bootstrap configuration has no version.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ClusterConfiguration {
    version: Option<Index>,
    members: Vec<Member>,
}

impl ClusterConfiguration {
    /// Later duplicates of a member id are dropped, keeping the first occurrence's position.
    pub(crate) fn new(version: Option<Index>, members: Vec<Member>) -> Self {
        let mut deduped: Vec<Member> = Vec::with_capacity(members.len());
        for member in members {
            if !deduped.iter().any(|m| m.id == member.id) {
                deduped.push(member);
            }
        }

        ClusterConfiguration {
            version,
            members: deduped,
        }
    }

    pub(crate) fn bootstrap(member_ids: Vec<ReplicaId>) -> Self {
        Self::new(
            None,
            member_ids
                .into_iter()
                .map(|id| Member::new(id, MemberType::Active))
                .collect(),
        )
    }

    pub(crate) fn version(&self) -> Option<Index> {
        self.version
    }

    pub(crate) fn members(&self) -> &[Member] {
        &self.members
    }

    pub(crate) fn member(&self, id: &ReplicaId) -> Option<&Member> {
        self.members.iter().find(|m| &m.id == id)
    }

    pub(crate) fn contains(&self, id: &ReplicaId) -> bool {
        self.member(id).is_some()
    }

    pub(crate) fn is_active(&self, id: &ReplicaId) -> bool {
        matches!(self.member(id), Some(m) if m.is_active())
    }

    pub(crate) fn active_ids(&self) -> impl Iterator<Item = &ReplicaId> {
        self.members.iter().filter(|m| m.is_active()).map(|m| &m.id)
    }

    pub(crate) fn num_active(&self) -> usize {
        self.active_ids().count()
    }

    /// Majority of Active members.
    pub(crate) fn quorum_size(&self) -> usize {
        self.num_active() / 2 + 1
    }

    /// Returns the member list after applying `change`, or `None` if the change is a no-op.
    pub(crate) fn apply_change(&self, change: &ConfigurationChange) -> Result<Option<Vec<Member>>, ChangeRejection> {
        let mut members = self.members.clone();
        match change {
            ConfigurationChange::Join { member, member_type } => match self.member(member) {
                Some(_) => return Ok(None),
                None => members.push(Member::new(member.clone(), *member_type)),
            },
            ConfigurationChange::Leave(id) => {
                if !self.contains(id) {
                    return Ok(None);
                }
                members.retain(|m| &m.id != id);
            }
            ConfigurationChange::Promote(id) => match members.iter_mut().find(|m| &m.id == id) {
                None => return Err(ChangeRejection::UnknownMember),
                Some(m) if m.is_active() => return Ok(None),
                Some(m) => m.member_type = MemberType::Active,
            },
            ConfigurationChange::Demote(id) => match members.iter_mut().find(|m| &m.id == id) {
                None => return Err(ChangeRejection::UnknownMember),
                Some(m) if !m.is_active() => return Ok(None),
                Some(m) => m.member_type = MemberType::Passive,
            },
        }

        if !members.iter().any(|m| m.is_active()) {
            return Err(ChangeRejection::LastActiveMember);
        }

        Ok(Some(members))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ChangeRejection {
    UnknownMember,
    LastActiveMember,
}

/// Every configuration still reachable from the retained log, oldest first. Configurations take
/// effect as soon as their entry is appended, so a truncated suffix must roll them back.
#[derive(Debug, Default)]
pub(crate) struct ConfigurationHistory {
    configurations: Vec<ClusterConfiguration>,
}

impl ConfigurationHistory {
    pub(crate) fn latest(&self) -> Option<&ClusterConfiguration> {
        self.configurations.last()
    }

    /// Configuration in effect once the entry at `index` is applied.
    pub(crate) fn at(&self, index: Index) -> Option<&ClusterConfiguration> {
        self.configurations
            .iter()
            .rev()
            .find(|c| c.version.map(|v| v <= index).unwrap_or(true))
    }

    pub(crate) fn push(&mut self, configuration: ClusterConfiguration) {
        self.configurations.push(configuration);
    }

    /// Drops configurations introduced at or after `index`.
    pub(crate) fn truncate_from(&mut self, index: Index) {
        self.configurations
            .retain(|c| c.version.map(|v| v < index).unwrap_or(true));
    }

    /// Drops configurations superseded at or before `index`.
    pub(crate) fn compact_to(&mut self, index: Index) {
        let keep_from = self
            .configurations
            .iter()
            .rposition(|c| c.version.map(|v| v <= index).unwrap_or(true))
            .unwrap_or(0);
        self.configurations.drain(..keep_from);
    }

    /// Replaces the history with the configuration carried by an installed snapshot, keeping
    /// later configurations from the retained log suffix.
    pub(crate) fn reset_to_snapshot(&mut self, snapshot_index: Index, configuration: ClusterConfiguration) {
        self.configurations
            .retain(|c| matches!(c.version, Some(v) if v > snapshot_index));
        self.configurations.insert(0, configuration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ReplicaId {
        ReplicaId::new(s)
    }

    fn config(version: u64, members: &[(&str, MemberType)]) -> ClusterConfiguration {
        ClusterConfiguration::new(
            Index::from_u64(version),
            members.iter().map(|(i, t)| Member::new(id(i), *t)).collect(),
        )
    }

    #[test]
    fn quorum_counts_only_active_members() {
        let c = config(
            0,
            &[
                ("a", MemberType::Active),
                ("b", MemberType::Active),
                ("c", MemberType::Passive),
                ("d", MemberType::Active),
            ],
        );
        assert_eq!(c.num_active(), 3);
        assert_eq!(c.quorum_size(), 2);

        assert_eq!(ClusterConfiguration::bootstrap(vec![id("a")]).quorum_size(), 1);
        assert_eq!(
            ClusterConfiguration::bootstrap(vec![id("a"), id("b"), id("c"), id("d")]).quorum_size(),
            3
        );
    }

    #[test]
    fn apply_change() {
        let c = config(3, &[("a", MemberType::Active), ("b", MemberType::Passive)]);

        let joined = c
            .apply_change(&ConfigurationChange::Join {
                member: id("c"),
                member_type: MemberType::Passive,
            })
            .unwrap()
            .unwrap();
        assert_eq!(joined.len(), 3);

        assert_eq!(
            c.apply_change(&ConfigurationChange::Join {
                member: id("a"),
                member_type: MemberType::Passive,
            }),
            Ok(None)
        );
        assert_eq!(c.apply_change(&ConfigurationChange::Promote(id("a"))), Ok(None));
        assert_eq!(
            c.apply_change(&ConfigurationChange::Promote(id("z"))),
            Err(ChangeRejection::UnknownMember)
        );
        assert_eq!(
            c.apply_change(&ConfigurationChange::Demote(id("a"))),
            Err(ChangeRejection::LastActiveMember)
        );
        assert_eq!(
            c.apply_change(&ConfigurationChange::Leave(id("a"))),
            Err(ChangeRejection::LastActiveMember)
        );
        assert_eq!(c.apply_change(&ConfigurationChange::Leave(id("z"))), Ok(None));

        let promoted = c.apply_change(&ConfigurationChange::Promote(id("b"))).unwrap().unwrap();
        assert!(promoted.iter().all(|m| m.is_active()));
    }

    #[test]
    fn history_truncate_and_compact() {
        let mut history = ConfigurationHistory::default();
        history.push(config(0, &[("a", MemberType::Active)]));
        history.push(config(4, &[("a", MemberType::Active), ("b", MemberType::Passive)]));
        history.push(config(9, &[("a", MemberType::Active), ("b", MemberType::Active)]));

        assert_eq!(history.at(Index::new(3)).unwrap().version(), None);
        assert_eq!(history.at(Index::new(8)).unwrap().version(), Some(Index::new(4)));
        assert_eq!(history.latest().unwrap().version(), Some(Index::new(9)));

        history.truncate_from(Index::new(9));
        assert_eq!(history.latest().unwrap().version(), Some(Index::new(4)));

        history.push(config(12, &[("a", MemberType::Active)]));
        history.compact_to(Index::new(10));
        assert_eq!(history.at(Index::new(10)).unwrap().version(), Some(Index::new(4)));
        assert_eq!(history.configurations.len(), 2);
    }

    #[test]
    fn history_reset_to_snapshot() {
        let mut history = ConfigurationHistory::default();
        history.push(config(0, &[("a", MemberType::Active)]));
        history.push(config(20, &[("a", MemberType::Active), ("b", MemberType::Active)]));

        history.reset_to_snapshot(Index::new(15), config(7, &[("x", MemberType::Active)]));

        assert_eq!(history.at(Index::new(15)).unwrap().version(), Some(Index::new(7)));
        assert_eq!(history.latest().unwrap().version(), Some(Index::new(20)));
    }
}
