use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::models::UserFileLink;
use super::tables::*;
use crate::fingerprint::Fingerprint;

/// Prefix shared by every name `owner` holds `fingerprint` under.
fn link_prefix(owner: &str, fingerprint: &Fingerprint) -> String {
    format!("{owner}\0{fingerprint}\0")
}

fn link_key(owner: &str, fingerprint: &Fingerprint, file_name: &str) -> String {
    format!("{}{file_name}", link_prefix(owner, fingerprint))
}

impl Database {
    // ========================================================================
    // User file links
    // ========================================================================

    /// Record that `link.owner` holds `link.fingerprint` under `link.file_name`.
    ///
    /// A link is the (owner, name, fingerprint) triple. Re-linking the same
    /// triple leaves the existing link untouched and returns `false`; the
    /// same content under another name is a separate link.
    pub fn link_user_file(&self, link: &UserFileLink) -> Result<bool, DatabaseError> {
        debug_assert!(!link.owner.contains('\0'), "owner must not contain NUL");

        let key = link_key(&link.owner, &link.fingerprint, &link.file_name);
        let write_txn = self.begin_write()?;

        let written = {
            let mut table = write_txn.open_table(USER_FILES)?;
            if table.get(key.as_str())?.is_some() {
                false
            } else {
                let data = rmp_serde::to_vec_named(link)?;
                table.insert(key.as_str(), data.as_slice())?;
                true
            }
        };

        write_txn.commit()?;
        Ok(written)
    }

    pub fn get_user_file(
        &self,
        owner: &str,
        fingerprint: &Fingerprint,
        file_name: &str,
    ) -> Result<Option<UserFileLink>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(USER_FILES)?;

        match table.get(link_key(owner, fingerprint, file_name).as_str())? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// Every name `owner` holds `fingerprint` under, ordered by name.
    pub fn user_files(
        &self,
        owner: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<UserFileLink>, DatabaseError> {
        let prefix = link_prefix(owner, fingerprint);
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(USER_FILES)?;

        let mut links = Vec::new();
        for result in table.range(prefix.as_str()..)? {
            let (key, value) = result?;
            if !key.value().starts_with(prefix.as_str()) {
                break;
            }
            links.push(rmp_serde::from_slice(value.value())?);
        }
        Ok(links)
    }

    /// Every link pointing at `fingerprint`, across all owners.
    pub fn links_to(&self, fingerprint: &Fingerprint) -> Result<Vec<UserFileLink>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(USER_FILES)?;

        let mut links = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            let link: UserFileLink = rmp_serde::from_slice(value.value())?;
            if link.fingerprint == *fingerprint {
                links.push(link);
            }
        }
        Ok(links)
    }
}
