//! Binding a fixed set of peers to a list.

use crate::error::PeerError;
use crate::identifier::PeerIdentifier;
use crate::list::PeerList;

/// Add `ids` to `list` in one update and hand the list back.
pub fn bind<L: PeerList>(
    list: L,
    ids: impl IntoIterator<Item = PeerIdentifier>,
) -> Result<L, PeerError> {
    list.update(ids.into_iter().collect(), Vec::new())?;
    Ok(list)
}

/// A list bound to a fixed set of peers that it can later give back.
#[derive(Debug)]
pub struct BoundList<L> {
    list: L,
    ids: Vec<PeerIdentifier>,
}

impl<L: PeerList> BoundList<L> {
    pub fn bind(list: L, ids: impl IntoIterator<Item = PeerIdentifier>) -> Result<Self, PeerError> {
        let ids: Vec<_> = ids.into_iter().collect();
        let list = bind(list, ids.iter().cloned())?;
        Ok(Self { list, ids })
    }

    pub fn list(&self) -> &L {
        &self.list
    }

    pub fn identifiers(&self) -> &[PeerIdentifier] {
        &self.ids
    }

    /// Remove exactly the bound peers and return the list.
    pub fn unbind(self) -> Result<L, PeerError> {
        self.list.update(Vec::new(), self.ids)?;
        Ok(self.list)
    }
}
