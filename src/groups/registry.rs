//! The registry of live groups.
//!
//! At startup [`GroupRegistry::load`] rebuilds every group by replaying its
//! moderation history from the event store. Once serving,
//! [`GroupRegistry::handle`] authorizes and applies new moderation events
//! as they arrive from many connections at once.

use std::{
    collections::{hash_map, HashMap},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{clock::Clock, event::Event, store::EventSource};

use super::{
    action::{Action, ModerationAction, KIND_CREATE_GROUP, MODERATION_KINDS},
    deleted::DeletedEventGuard,
    error::GroupError,
    policy::Authorizer,
    Group, GroupAddress, GroupState, Role, Transition,
};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Knobs for building and maintaining groups.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// `wss://` address of this relay, stamped on every group address.
    pub relay_url: String,
    /// Roles every new group starts with.
    pub roles: Vec<Role>,
    /// Role the creator of a group receives.
    pub creator_role: String,
    /// Role given to members added without a known role.
    pub member_role: Option<String>,
    /// Cap on the history fetched per group during replay.
    pub max_moderation_events: usize,
    /// How long deleted event ids are refused.
    pub deleted_grace: Duration,
    /// Live moderation events older than this are refused. Zero disables.
    pub max_action_age: Duration,
}

impl RegistryConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            roles: vec![Role::new("admin"), Role::new("moderator"), Role::new("member")],
            creator_role: "admin".into(),
            member_role: Some("member".into()),
            max_moderation_events: 500,
            deleted_grace: Duration::from_secs(60),
            max_action_age: Duration::from_secs(60),
        }
    }
}

/// Notification that a group changed, for hosts that rebroadcast group state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupChange {
    pub group_id: String,
    pub event_id: String,
    pub kind: u32,
    pub transition: Transition,
}

/// Owns every live group aggregate of one relay.
pub struct GroupRegistry {
    groups: DashMap<String, Arc<Group>>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    deleted: Arc<DeletedEventGuard>,
    changes: broadcast::Sender<GroupChange>,
}

impl GroupRegistry {
    pub fn new(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        let deleted = Arc::new(DeletedEventGuard::new(config.deleted_grace, clock.clone()));
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            groups: DashMap::new(),
            config,
            clock,
            deleted,
            changes,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Fresh state for a group created by `creator`.
    pub fn new_group_state(&self, id: &str, creator: &str) -> GroupState {
        let mut state = GroupState::new(
            GroupAddress {
                id: id.to_string(),
                relay: self.config.relay_url.clone(),
            },
            self.config.roles.clone(),
            self.config.member_role.clone(),
        );
        let creator_role = state
            .role(&self.config.creator_role)
            .cloned()
            .unwrap_or_else(|| Role::new(self.config.creator_role.as_str()));
        state.members.insert(creator.to_ascii_lowercase(), vec![creator_role]);
        state
    }

    /// Rebuild all groups from `source`. Must run before the registry is
    /// shared. Returns the number of live groups.
    ///
    /// Only the newest creation event of an id counts, and only history
    /// from that creation on is replayed. A group whose newest action is a
    /// deletion is not registered.
    pub fn load(&mut self, source: &dyn EventSource) -> Result<usize> {
        let mut creations: HashMap<String, Event> = HashMap::new();
        for ev in source.events_of_kind(KIND_CREATE_GROUP)? {
            let Some(id) = ev.group_id() else {
                warn!(id = %ev.id, "create-group event without group tag");
                continue;
            };
            match creations.entry(id.to_string()) {
                hash_map::Entry::Occupied(mut slot) => {
                    if ev.created_at > slot.get().created_at {
                        slot.insert(ev);
                    }
                }
                hash_map::Entry::Vacant(slot) => {
                    slot.insert(ev);
                }
            }
        }

        for (id, creation) in creations {
            let mut history =
                source.group_events(MODERATION_KINDS, &id, self.config.max_moderation_events)?;
            history.retain(|ev| ev.created_at >= creation.created_at);
            // newest first; stable, so the source's order breaks ties
            history.sort_by(|a, b| b.created_at.cmp(&a.created_at));

            let mut state = self.new_group_state(&id, &creation.pubkey);
            let mut last_was_delete = false;
            for ev in history.iter().rev() {
                match ModerationAction::from_event(ev) {
                    Ok(act) => {
                        state.apply(&act.action);
                        last_was_delete = matches!(act.action, Action::DeleteGroup);
                    }
                    Err(e) => warn!(group = %id, id = %ev.id, error = %e, "dropping malformed moderation event"),
                }
            }

            if last_was_delete {
                debug!(group = %id, "group was deleted, not loading");
                continue;
            }
            state.deleted = false;
            self.groups.insert(id, Arc::new(Group::new(state)));
        }

        info!(groups = self.groups.len(), "loaded groups");
        Ok(self.groups.len())
    }

    /// Live group an event refers to through its `h` tag.
    pub fn resolve(&self, event: &Event) -> Option<Arc<Group>> {
        self.get(event.group_id()?)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Group>> {
        self.groups.get(id).map(|g| g.value().clone())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Ids of all live groups, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.groups.iter().map(|g| g.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn deleted_guard(&self) -> &Arc<DeletedEventGuard> {
        &self.deleted
    }

    /// Receive a [`GroupChange`] for every live action that changed a group.
    pub fn subscribe(&self) -> broadcast::Receiver<GroupChange> {
        self.changes.subscribe()
    }

    /// Validate, authorize and apply a live moderation event.
    ///
    /// `authorizer` is consulted exactly once. `authorizer` must not call
    /// back into this registry for the same group: for existing groups it
    /// runs under that group's write lock.
    pub fn handle(&self, event: &Event, authorizer: &dyn Authorizer) -> Result<Transition, GroupError> {
        let group_id = event.group_id().ok_or(GroupError::MissingGroupTag)?;
        if self.deleted.is_recently_deleted(&event.id) {
            return Err(GroupError::RecentlyDeleted(event.id.clone()));
        }
        let max_age = self.config.max_action_age.as_secs();
        if max_age > 0 && event.created_at < self.clock.now().saturating_sub(max_age) {
            return Err(GroupError::TooOld);
        }
        let act = ModerationAction::from_event(event)?;

        let transition = if matches!(act.action, Action::CreateGroup) {
            self.create(group_id, &act, authorizer)?
        } else {
            self.update(group_id, &act, authorizer)?
        };

        if transition != Transition::Unchanged {
            // no subscribers is fine
            let _ = self.changes.send(GroupChange {
                group_id: group_id.to_string(),
                event_id: event.id.clone(),
                kind: event.kind,
                transition,
            });
        }
        Ok(transition)
    }

    fn create(
        &self,
        group_id: &str,
        act: &ModerationAction,
        authorizer: &dyn Authorizer,
    ) -> Result<Transition, GroupError> {
        if self.groups.contains_key(group_id) {
            return Err(GroupError::GroupExists(group_id.to_string()));
        }
        let state = self.new_group_state(group_id, &act.actor);
        if !authorizer.allow(&state, &act.actor, state.member_roles(&act.actor), &act.action) {
            return Err(denied(&act.action));
        }
        match self.groups.entry(group_id.to_string()) {
            Entry::Occupied(_) => Err(GroupError::GroupExists(group_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Group::new(state)));
                info!(group = %group_id, creator = %act.actor, "group created");
                Ok(Transition::Updated)
            }
        }
    }

    fn update(
        &self,
        group_id: &str,
        act: &ModerationAction,
        authorizer: &dyn Authorizer,
    ) -> Result<Transition, GroupError> {
        let group = self
            .get(group_id)
            .ok_or_else(|| GroupError::UnknownGroup(group_id.to_string()))?;
        let mut state = group.write();
        // lost a race with a concurrent delete
        if state.deleted {
            return Err(GroupError::UnknownGroup(group_id.to_string()));
        }
        if !authorizer.allow(&state, &act.actor, state.member_roles(&act.actor), &act.action) {
            return Err(denied(&act.action));
        }

        let transition = state.apply(&act.action);
        match &act.action {
            Action::DeleteGroup => {
                self.groups.remove_if(group_id, |_, g| Arc::ptr_eq(g, &group));
                info!(group = %group_id, by = %act.actor, "group deleted");
            }
            Action::DeleteEvent(ids) => {
                for id in ids {
                    self.deleted.mark_deleted(id);
                }
                debug!(group = %group_id, count = ids.len(), "events deleted");
            }
            _ => {}
        }
        Ok(transition)
    }
}

fn denied(action: &Action) -> GroupError {
    GroupError::Denied(format!("insufficient permissions to {}", action.name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        event::{
            testing::{pubkey, signed, signed_upper},
            Tag,
        },
        groups::{
            action::{
                KIND_DELETE_EVENT, KIND_DELETE_GROUP, KIND_EDIT_METADATA, KIND_PUT_USER,
                KIND_REMOVE_USER,
            },
            policy::CapabilityPolicy,
        },
        store::MemoryStore,
    };
    use std::{sync::mpsc, thread};

    const NOW: u64 = 1_700_000_000;
    const A: u8 = 1;
    const B: u8 = 2;
    const C: u8 = 3;

    fn registry(clock: &Arc<ManualClock>) -> GroupRegistry {
        GroupRegistry::new(RegistryConfig::new("wss://relay.example"), clock.clone())
    }

    fn allow_all() -> impl Authorizer {
        |_: &GroupState, _: &str, _: &[Role], _: &Action| true
    }

    fn create(by: u8, id: &str, at: u64) -> Event {
        signed(by, KIND_CREATE_GROUP, at, vec![Tag::new(["h", id])])
    }

    fn put(by: u8, id: &str, who: u8, role: &str, at: u64) -> Event {
        let who = pubkey(who);
        signed(
            by,
            KIND_PUT_USER,
            at,
            vec![Tag::new(["h", id]), Tag::new(["p", who.as_str(), role])],
        )
    }

    fn remove(by: u8, id: &str, who: u8, at: u64) -> Event {
        let who = pubkey(who);
        signed(
            by,
            KIND_REMOVE_USER,
            at,
            vec![Tag::new(["h", id]), Tag::new(["p", who.as_str()])],
        )
    }

    fn delete_group(by: u8, id: &str, at: u64) -> Event {
        signed(by, KIND_DELETE_GROUP, at, vec![Tag::new(["h", id])])
    }

    fn loaded(events: Vec<Event>) -> GroupRegistry {
        let store = MemoryStore::new();
        for ev in events {
            store.ingest(ev);
        }
        let clock = Arc::new(ManualClock::new(NOW));
        let mut reg = registry(&clock);
        reg.load(&store).unwrap();
        reg
    }

    fn members(reg: &GroupRegistry, id: &str) -> Vec<String> {
        reg.get(id).unwrap().read().members.keys().cloned().collect()
    }

    #[test]
    fn replay_add_then_remove() {
        let reg = loaded(vec![
            create(A, "g", 10),
            put(A, "g", B, "member", 11),
            remove(A, "g", B, 12),
        ]);
        assert_eq!(members(&reg, "g"), vec![pubkey(A)]);
        let g = reg.get("g").unwrap();
        assert_eq!(g.read().member_roles(&pubkey(A)), &[Role::new("admin")]);
        assert_eq!(g.read().address.relay, "wss://relay.example");
    }

    #[test]
    fn replay_deleted_group_is_absent() {
        let reg = loaded(vec![
            create(A, "g", 10),
            put(A, "g", B, "member", 11),
            delete_group(A, "g", 12),
            create(A, "h", 10),
        ]);
        assert!(reg.get("g").is_none());
        assert_eq!(reg.ids(), vec!["h".to_string()]);
    }

    #[test]
    fn replay_applies_oldest_first_regardless_of_ingest_order() {
        let reg = loaded(vec![
            remove(A, "g", B, 12),
            put(A, "g", B, "member", 11),
            create(A, "g", 10),
            put(A, "g", C, "member", 13),
        ]);
        let mut expected = vec![pubkey(A), pubkey(C)];
        expected.sort();
        assert_eq!(members(&reg, "g"), expected);
    }

    #[test]
    fn recreated_group_starts_clean() {
        let reg = loaded(vec![
            create(A, "g", 10),
            put(A, "g", B, "member", 11),
            delete_group(A, "g", 12),
            create(C, "g", 20),
            put(C, "g", A, "member", 21),
        ]);
        let g = reg.get("g").unwrap();
        let state = g.read();
        assert!(!state.is_member(&pubkey(B)));
        assert_eq!(state.member_roles(&pubkey(C)), &[Role::new("admin")]);
        assert_eq!(state.member_roles(&pubkey(A)), &[Role::new("member")]);
    }

    #[test]
    fn replay_drops_malformed_history() {
        let bad = signed(
            A,
            KIND_PUT_USER,
            11,
            vec![Tag::new(["h", "g"]), Tag::new(["p", "short"])],
        );
        let reg = loaded(vec![create(A, "g", 10), bad, put(A, "g", B, "member", 12)]);
        assert_eq!(reg.get("g").unwrap().read().members.len(), 2);
    }

    #[test]
    fn replay_respects_history_cap() {
        let store = MemoryStore::new();
        store.ingest(create(A, "g", 10));
        store.ingest(put(A, "g", B, "member", 11));
        store.ingest(put(A, "g", C, "member", 12));
        let clock = Arc::new(ManualClock::new(NOW));
        let mut config = RegistryConfig::new("wss://relay.example");
        config.max_moderation_events = 1;
        let mut reg = GroupRegistry::new(config, clock);
        assert_eq!(reg.load(&store).unwrap(), 1);
        let g = reg.get("g").unwrap();
        assert!(!g.read().is_member(&pubkey(B)));
        assert!(g.read().is_member(&pubkey(C)));
    }

    #[test]
    fn uppercase_author_is_one_member() {
        let upper_a = pubkey(A).to_ascii_uppercase();
        let remove_upper = signed(
            B,
            KIND_REMOVE_USER,
            11,
            vec![Tag::new(["h", "g"]), Tag::new(["p", upper_a.as_str()])],
        );
        let reg = loaded(vec![
            signed_upper(A, KIND_CREATE_GROUP, 10, vec![Tag::new(["h", "g"])]),
            remove_upper,
        ]);
        assert!(members(&reg, "g").is_empty());

        let clock = Arc::new(ManualClock::new(NOW));
        let reg = registry(&clock);
        let all = allow_all();
        reg.handle(
            &signed_upper(A, KIND_CREATE_GROUP, NOW, vec![Tag::new(["h", "g"])]),
            &all,
        )
        .unwrap();
        reg.handle(&put(B, "g", A, "member", NOW), &all).unwrap();
        assert_eq!(members(&reg, "g"), vec![pubkey(A)]);
        assert_eq!(
            reg.get("g").unwrap().read().member_roles(&pubkey(A)),
            &[Role::new("member")]
        );
    }

    #[test]
    fn resolve_by_group_tag() {
        let reg = loaded(vec![create(A, "g", 10)]);
        let chat = signed(B, 9, 11, vec![Tag::new(["h", "g"])]);
        assert!(reg.resolve(&chat).is_some());
        let elsewhere = signed(B, 9, 11, vec![Tag::new(["h", "nope"])]);
        assert!(reg.resolve(&elsewhere).is_none());
        assert!(reg.resolve(&signed(B, 9, 11, vec![])).is_none());
    }

    #[test]
    fn live_create_put_and_duplicate_create() {
        let clock = Arc::new(ManualClock::new(NOW));
        let reg = registry(&clock);
        let policy = CapabilityPolicy::standard(None);
        assert_eq!(reg.handle(&create(A, "g", NOW), &policy), Ok(Transition::Updated));
        assert_eq!(
            reg.handle(&create(B, "g", NOW), &policy),
            Err(GroupError::GroupExists("g".into()))
        );
        assert_eq!(
            reg.handle(&put(A, "g", B, "member", NOW), &policy),
            Ok(Transition::Updated)
        );
        assert_eq!(
            reg.handle(&put(A, "g", B, "member", NOW + 1), &policy),
            Ok(Transition::Unchanged)
        );
        assert!(reg.get("g").unwrap().read().is_member(&pubkey(B)));
    }

    #[test]
    fn denied_action_leaves_state_untouched() {
        let clock = Arc::new(ManualClock::new(NOW));
        let reg = registry(&clock);
        let policy = CapabilityPolicy::standard(None);
        reg.handle(&create(A, "g", NOW), &policy).unwrap();
        reg.handle(&put(A, "g", B, "member", NOW), &policy).unwrap();
        let before = reg.get("g").unwrap().snapshot();

        let err = reg.handle(&put(B, "g", C, "admin", NOW), &policy).unwrap_err();
        assert!(matches!(err, GroupError::Denied(ref reason) if reason.contains("put-user")));
        let edit = signed(
            B,
            KIND_EDIT_METADATA,
            NOW,
            vec![Tag::new(["h", "g"]), Tag::new(["name", "mine"])],
        );
        assert!(matches!(reg.handle(&edit, &policy), Err(GroupError::Denied(_))));
        assert_eq!(reg.get("g").unwrap().snapshot(), before);
    }

    #[test]
    fn authorizer_called_once_per_action() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let clock = Arc::new(ManualClock::new(NOW));
        let reg = registry(&clock);
        let calls = AtomicUsize::new(0);
        let counting = |_: &GroupState, _: &str, _: &[Role], _: &Action| {
            calls.fetch_add(1, Ordering::SeqCst);
            true
        };
        reg.handle(&create(A, "g", NOW), &counting).unwrap();
        reg.handle(&put(A, "g", B, "member", NOW), &counting).unwrap();
        reg.handle(&remove(A, "g", B, NOW), &counting).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn live_rejections() {
        let clock = Arc::new(ManualClock::new(NOW));
        let reg = registry(&clock);
        let all = allow_all();
        assert_eq!(
            reg.handle(&signed(A, KIND_PUT_USER, NOW, vec![]), &all),
            Err(GroupError::MissingGroupTag)
        );
        assert_eq!(
            reg.handle(&put(A, "nope", B, "member", NOW), &all),
            Err(GroupError::UnknownGroup("nope".into()))
        );
        assert_eq!(reg.handle(&create(A, "g", NOW - 61), &all), Err(GroupError::TooOld));
        let malformed = signed(A, KIND_PUT_USER, NOW, vec![Tag::new(["h", "g"])]);
        assert!(matches!(reg.handle(&malformed, &all), Err(GroupError::Malformed(_))));
    }

    #[test]
    fn live_delete_group_removes_and_notifies() {
        let clock = Arc::new(ManualClock::new(NOW));
        let reg = registry(&clock);
        let mut rx = reg.subscribe();
        let all = allow_all();
        reg.handle(&create(A, "g", NOW), &all).unwrap();
        let del = delete_group(A, "g", NOW);
        assert_eq!(reg.handle(&del, &all), Ok(Transition::Deleted));
        assert!(reg.get("g").is_none());
        assert!(reg.is_empty());

        assert_eq!(rx.try_recv().unwrap().kind, KIND_CREATE_GROUP);
        let change = rx.try_recv().unwrap();
        assert_eq!(change.group_id, "g");
        assert_eq!(change.event_id, del.id);
        assert_eq!(change.transition, Transition::Deleted);

        // a fresh timeline may begin under the same id
        assert_eq!(reg.handle(&create(B, "g", NOW), &all), Ok(Transition::Updated));
    }

    #[test]
    fn deleted_events_refused_during_grace() {
        let clock = Arc::new(ManualClock::new(NOW));
        let reg = registry(&clock);
        let all = allow_all();
        reg.handle(&create(A, "g", NOW), &all).unwrap();
        let victim = put(A, "g", B, "member", NOW);
        let del = signed(
            A,
            KIND_DELETE_EVENT,
            NOW,
            vec![Tag::new(["h", "g"]), Tag::new(["e", victim.id.as_str()])],
        );
        reg.handle(&del, &all).unwrap();
        assert_eq!(
            reg.handle(&victim, &all),
            Err(GroupError::RecentlyDeleted(victim.id.clone()))
        );

        clock.advance(61);
        assert!(!reg.deleted_guard().is_recently_deleted(&victim.id));
        // by now the event is also too old to be accepted
        assert_eq!(reg.handle(&victim, &all), Err(GroupError::TooOld));
    }

    #[test]
    fn concurrent_put_remove_same_group_loses_nothing() {
        let clock = Arc::new(ManualClock::new(NOW));
        let reg = registry(&clock);
        let all = allow_all();
        reg.handle(&create(A, "g", NOW), &all).unwrap();

        const THREADS: u8 = 8;
        const ROUNDS: u64 = 20;
        let batches: Vec<Vec<Event>> = (0..THREADS)
            .map(|t| {
                let who = 10 + t;
                (0..ROUNDS)
                    .flat_map(|r| {
                        [
                            put(A, "g", who, "member", NOW - r),
                            remove(A, "g", who, NOW - r),
                        ]
                    })
                    .chain(std::iter::once(put(A, "g", who, "member", NOW)))
                    .collect()
            })
            .collect();

        thread::scope(|s| {
            for batch in &batches {
                let reg = &reg;
                let all = &all;
                s.spawn(move || {
                    for ev in batch {
                        reg.handle(ev, all).unwrap();
                    }
                });
            }
        });

        let g = reg.get("g").unwrap();
        let state = g.read();
        assert_eq!(state.members.len(), 1 + THREADS as usize);
        for t in 0..THREADS {
            assert!(state.is_member(&pubkey(10 + t)));
        }
    }

    #[test]
    fn distinct_groups_do_not_block_each_other() {
        let clock = Arc::new(ManualClock::new(NOW));
        let reg = registry(&clock);
        let all = allow_all();
        reg.handle(&create(A, "one", NOW), &all).unwrap();
        reg.handle(&create(A, "two", NOW), &all).unwrap();

        let one = reg.get("one").unwrap();
        let held = one.write();
        let ev = put(A, "two", B, "member", NOW);
        let (tx, rx) = mpsc::channel();
        thread::scope(|s| {
            let reg = &reg;
            let all = &all;
            let ev = &ev;
            s.spawn(move || {
                tx.send(reg.handle(ev, all)).unwrap();
            });
            let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(result, Ok(Transition::Updated));
        });
        drop(held);
    }
}
