use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use rusqlite::Connection;
use serde::Serialize;

use crate::utils::open_db;

/// A canonical id plus the name chosen for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DisplayIdentity {
    pub id: String,
    pub display: String,
}

impl DisplayIdentity {
    pub fn new(id: impl Into<String>, display: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display: display.into(),
        }
    }

    /// Identity that displays as its own id.
    pub fn bare(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display: id.clone(),
            id,
        }
    }

    /// `name(id)`, or just the id when no better name exists.
    pub fn label(&self) -> String {
        if self.display == self.id {
            self.id.clone()
        } else {
            format!("{}({})", self.display, self.id)
        }
    }
}

impl fmt::Display for DisplayIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

/// Personal contact names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contact {
    pub id: String,
    pub remark: String,
    pub alias: String,
    pub nickname: String,
}

/// Names a member carries inside one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupMember {
    pub group_id: String,
    pub member_id: String,
    pub group_remark: String,
    pub nickname: String,
    pub alias: String,
}

/// One step of the display priority chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameSource {
    GroupRemark,
    GroupNickname,
    GroupAlias,
    Remark,
    Alias,
    Nickname,
}

/// Evaluated in order, first non-blank name wins. Group steps only apply
/// when the lookup happens inside a group.
pub const DISPLAY_PRIORITY: &[NameSource] = &[
    NameSource::GroupRemark,
    NameSource::GroupNickname,
    NameSource::GroupAlias,
    NameSource::Remark,
    NameSource::Alias,
    NameSource::Nickname,
];

fn non_blank(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

fn name_from<'a>(
    source: NameSource,
    contact: Option<&'a Contact>,
    member: Option<&'a GroupMember>,
) -> Option<&'a str> {
    let value = match source {
        NameSource::GroupRemark => &member?.group_remark,
        NameSource::GroupNickname => &member?.nickname,
        NameSource::GroupAlias => &member?.alias,
        NameSource::Remark => &contact?.remark,
        NameSource::Alias => &contact?.alias,
        NameSource::Nickname => &contact?.nickname,
    };
    non_blank(value)
}

#[derive(Debug, Clone, Default)]
pub struct Directory {
    contacts: HashMap<String, Contact>,
    groups: HashMap<String, HashMap<String, GroupMember>>,
}

impl Directory {
    /// Load both sources from the contact database.
    ///
    /// A missing path or a database without the expected tables yields an
    /// empty source; lookups then fall back to canonical ids.
    pub fn load(contact_db: Option<&Path>) -> Self {
        let mut directory = Self::default();
        let Some(path) = contact_db.filter(|p| p.is_file()) else {
            return directory;
        };

        let conn = match open_db(path) {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "contact database unreadable");
                return directory;
            }
        };

        match load_contacts(&conn) {
            Ok(contacts) => contacts.into_iter().for_each(|c| directory.insert_contact(c)),
            Err(err) => tracing::warn!(error = %err, "skipping personal contact names"),
        }
        match load_group_members(&conn) {
            Ok(members) => members
                .into_iter()
                .for_each(|m| directory.insert_group_member(m)),
            Err(err) => tracing::warn!(error = %err, "skipping group member names"),
        }

        tracing::info!(
            contacts = directory.contacts.len(),
            groups = directory.groups.len(),
            "loaded contact directory"
        );
        directory
    }

    pub fn insert_contact(&mut self, contact: Contact) {
        self.contacts.insert(contact.id.clone(), contact);
    }

    pub fn insert_group_member(&mut self, member: GroupMember) {
        self.groups
            .entry(member.group_id.clone())
            .or_default()
            .insert(member.member_id.clone(), member);
    }

    pub fn contact(&self, id: &str) -> Option<&Contact> {
        self.contacts.get(id)
    }

    pub fn group_member(&self, group_id: &str, member_id: &str) -> Option<&GroupMember> {
        self.groups.get(group_id)?.get(member_id)
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty() && self.groups.is_empty()
    }

    /// Pick a display name for `id`, optionally inside `group`.
    ///
    /// Always returns a non-empty display unless `id` itself is empty.
    pub fn resolve(&self, id: &str, group: Option<&str>) -> DisplayIdentity {
        let contact = self.contacts.get(id);
        let member = group.and_then(|g| self.group_member(g, id));

        DISPLAY_PRIORITY
            .iter()
            .find_map(|&source| name_from(source, contact, member))
            .map(|name| DisplayIdentity::new(id, name))
            .unwrap_or_else(|| DisplayIdentity::bare(id))
    }

    /// Canonical ids among `candidates` that `query` refers to.
    ///
    /// Tiers, first non-empty wins: exact id; exact (case-insensitive) name
    /// or label; substring of id or name.
    pub fn match_query<'a, I>(&self, query: &str, candidates: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
        I::IntoIter: Clone,
    {
        let query = query.trim();
        let candidates = candidates.into_iter();
        if query.is_empty() {
            return BTreeSet::new();
        }

        if let Some(id) = candidates.clone().find(|id| id.as_str() == query) {
            return BTreeSet::from([id.clone()]);
        }

        let lower = query.to_lowercase();
        let stripped = query
            .split_once('(')
            .map(|(name, _)| name.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        let exact: BTreeSet<String> = candidates
            .clone()
            .filter(|id| {
                self.names_of(id).iter().any(|name| {
                    let name = name.to_lowercase();
                    name == lower || stripped.as_deref() == Some(name.as_str())
                })
            })
            .cloned()
            .collect();
        if !exact.is_empty() {
            return exact;
        }

        candidates
            .filter(|id| {
                id.to_lowercase().contains(&lower)
                    || self
                        .names_of(id)
                        .iter()
                        .any(|name| name.to_lowercase().contains(&lower))
            })
            .cloned()
            .collect()
    }

    fn names_of(&self, id: &str) -> Vec<String> {
        let Some(contact) = self.contacts.get(id) else {
            return Vec::new();
        };
        let mut names: Vec<String> = [&contact.remark, &contact.alias, &contact.nickname]
            .into_iter()
            .filter_map(|n| non_blank(n).map(str::to_owned))
            .collect();
        let label = self.resolve(id, None).label();
        if label != id {
            names.push(label);
        }
        names
    }
}

fn load_contacts(conn: &Connection) -> rusqlite::Result<Vec<Contact>> {
    let mut stmt = conn.prepare(
        "SELECT n.userName,
                IFNULL(c.c0alias, ''),
                IFNULL(c.c1nickname, ''),
                IFNULL(c.c2remark, '')
         FROM FTSContact15_content AS c
         JOIN FTSContact15_MetaData AS m ON m.docid = c.docid
         JOIN NameToId AS n ON n.rowid = m.entityId
         WHERE n.userName IS NOT NULL",
    )?;
    stmt.query_map([], |row| {
        Ok(Contact {
            id: row.get(0)?,
            alias: row.get(1)?,
            nickname: row.get(2)?,
            remark: row.get(3)?,
        })
    })?
    .collect()
}

fn load_group_members(conn: &Connection) -> rusqlite::Result<Vec<GroupMember>> {
    let mut stmt = conn.prepare(
        "SELECT chat.userName,
                member.userName,
                IFNULL(c.c0groupRemark, ''),
                IFNULL(c.c1nickname, ''),
                IFNULL(c.c2alias, '')
         FROM FTSChatroom15_content AS c
         JOIN FTSChatroom15_MetaData AS m ON m.docid = c.docid
         LEFT JOIN NameToId AS chat ON chat.rowid = m.groupTalkerId
         LEFT JOIN NameToId AS member ON member.rowid = m.talkerId
         WHERE chat.userName IS NOT NULL AND member.userName IS NOT NULL",
    )?;
    stmt.query_map([], |row| {
        Ok(GroupMember {
            group_id: row.get(0)?,
            member_id: row.get(1)?,
            group_remark: row.get(2)?,
            nickname: row.get(3)?,
            alias: row.get(4)?,
        })
    })?
    .collect()
}
