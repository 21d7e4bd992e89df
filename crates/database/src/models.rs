use crate::error::{Error, ErrorKind};
use exn::OptionExt;
use stash_storage::{BlobRecord, Slot};

/// A `NULL` mime type marks a tombstone.
#[derive(sqlx::FromRow)]
pub(crate) struct SlotRow {
    mime_type: Option<String>,
    bytes: Option<Vec<u8>>,
}
impl TryFrom<SlotRow> for Slot {
    type Error = Error;
    fn try_from(row: SlotRow) -> Result<Self, Self::Error> {
        match row.mime_type {
            None => Ok(Slot::Tombstone),
            Some(mime_type) => {
                let bytes = row.bytes.ok_or_raise(|| ErrorKind::InvalidData("blob without bytes"))?;
                Ok(Slot::Present(BlobRecord::new(mime_type, bytes)))
            },
        }
    }
}
