//! Helpers shared by stages.

use sluice_core::{Column, Error};

use crate::message::Message;
use crate::packets::{DataColumnsPacket, Packet};

/// Resolve the columns for the table a message is importing.
///
/// Prefers a cached `DataColumns` packet; otherwise fetches the schema from
/// the source, optionally caching it on the message for later stages.
pub async fn get_columns(message: &mut Message, add_if_missing: bool) -> Result<Vec<Column>, Error> {
    if let Some(packet) = message.packets.columns() {
        return Ok(packet.columns.clone());
    }

    let (source, table) = {
        let import = message.packets.import_table()?;
        (import.source.clone(), import.src_table.clone())
    };

    let columns = source.get_columns(&table).await?;

    if add_if_missing {
        message.packets.add(Packet::DataColumns(DataColumnsPacket {
            columns: columns.clone(),
        }));
    }

    Ok(columns)
}
