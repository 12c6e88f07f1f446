// Room access policy consulted on every join.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::{anyhow, bail};
use flowpresence_common::types::{RoomId, UserId};

/// User entry that admits any user to a room.
pub const ANY_USER: &str = "*";

type RoomTable = HashMap<RoomId, HashSet<UserId>>;

#[derive(Debug, Clone, Default)]
pub enum RoomAccessStore {
    /// Every user may join every room.
    #[default]
    Open,
    /// Only listed users may join listed rooms. Unlisted rooms are closed.
    /// The table is fixed for the life of the process.
    Memory(Arc<RoomTable>),
}

impl RoomAccessStore {
    pub fn from_table(table: RoomTable) -> Self {
        Self::Memory(Arc::new(table))
    }

    pub fn allows(&self, room_id: &RoomId, user_id: &UserId) -> bool {
        match self {
            Self::Open => true,
            Self::Memory(table) => {
                table.get(room_id).is_some_and(|users| users.contains(user_id) || users.contains(ANY_USER))
            }
        }
    }
}

/// Parse `room=user|user;room2=user` into a room table.
pub fn parse_room_acl(raw: &str) -> anyhow::Result<RoomTable> {
    let mut table = RoomTable::new();
    for entry in raw.split(';').map(str::trim).filter(|entry| !entry.is_empty()) {
        let (room, users) =
            entry.split_once('=').ok_or_else(|| anyhow!("room ACL entry `{entry}` is missing `=`"))?;
        let room = room.trim();
        if room.is_empty() {
            bail!("room ACL entry `{entry}` has an empty room id");
        }
        let users: HashSet<UserId> =
            users.split('|').map(str::trim).filter(|user| !user.is_empty()).map(UserId::from).collect();
        if users.is_empty() {
            bail!("room ACL entry `{entry}` lists no users");
        }
        table.entry(RoomId::from(room)).or_default().extend(users);
    }
    Ok(table)
}
