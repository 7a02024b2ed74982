//! The packets delivered with pipeline messages.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use sluice_core::{Column, Destination, Error, RowFormat, Source};

/// Packet describing a table to be imported.
#[derive(Clone)]
pub struct ImportTablePacket {
    pub source: Arc<dyn Source>,
    pub src_table: String,
    pub dest_table: String,
}

impl fmt::Debug for ImportTablePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportTablePacket")
            .field("src_table", &self.src_table)
            .field("dest_table", &self.dest_table)
            .finish()
    }
}

/// Packet describing the destination for the import.
#[derive(Clone)]
pub struct DestinationPacket {
    pub destination: Arc<dyn Destination>,
}

impl fmt::Debug for DestinationPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationPacket").finish()
    }
}

/// Packet caching the resolved schema for the table being imported.
#[derive(Debug, Clone)]
pub struct DataColumnsPacket {
    pub columns: Vec<Column>,
}

/// Packet describing the encoding of subsequent data packets.
#[derive(Debug, Clone)]
pub struct DataFormatPacket {
    pub format: RowFormat,
}

/// Packet carrying a batch of encoded rows ready to be ingested.
#[derive(Debug, Clone)]
pub struct DataLoadPacket {
    pub data: String,
    pub index: usize,
    pub rows: usize,
}

/// Packet describing a batch materialized on disk.
#[derive(Debug, Clone)]
pub struct DataFilePacket {
    pub path: PathBuf,
    pub expect_warning: bool,
}

/// Packet handing off an unload staged on remote storage.
#[derive(Debug, Clone)]
pub struct DataUnloadPacket {
    pub bucket: String,
    pub key: String,
}

/// The kind tags packets are filtered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    ImportTable,
    Destination,
    DataColumns,
    DataFormat,
    DataLoad,
    DataFile,
    DataComplete,
    DataUnload,
}

impl PacketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::ImportTable => "ImportTable",
            PacketKind::Destination => "Destination",
            PacketKind::DataColumns => "DataColumns",
            PacketKind::DataFormat => "DataFormat",
            PacketKind::DataLoad => "DataLoad",
            PacketKind::DataFile => "DataFile",
            PacketKind::DataComplete => "DataComplete",
            PacketKind::DataUnload => "DataUnload",
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every packet kind; used by stages which react to any message.
pub const ALL_PACKETS: &[PacketKind] = &[
    PacketKind::ImportTable,
    PacketKind::Destination,
    PacketKind::DataColumns,
    PacketKind::DataFormat,
    PacketKind::DataLoad,
    PacketKind::DataFile,
    PacketKind::DataComplete,
    PacketKind::DataUnload,
];

/// A tagged packet as added to a message.
#[derive(Debug, Clone)]
pub enum Packet {
    ImportTable(ImportTablePacket),
    Destination(DestinationPacket),
    DataColumns(DataColumnsPacket),
    DataFormat(DataFormatPacket),
    DataLoad(DataLoadPacket),
    DataFile(DataFilePacket),
    DataComplete,
    DataUnload(DataUnloadPacket),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::ImportTable(_) => PacketKind::ImportTable,
            Packet::Destination(_) => PacketKind::Destination,
            Packet::DataColumns(_) => PacketKind::DataColumns,
            Packet::DataFormat(_) => PacketKind::DataFormat,
            Packet::DataLoad(_) => PacketKind::DataLoad,
            Packet::DataFile(_) => PacketKind::DataFile,
            Packet::DataComplete => PacketKind::DataComplete,
            Packet::DataUnload(_) => PacketKind::DataUnload,
        }
    }
}

/// The set of packets carried by one message.
///
/// Singleton kinds occupy one optional slot each, so adding a second packet
/// of a singleton kind replaces the first; the data kinds which may repeat
/// (`DataLoad`, `DataFile`) are kept in order of addition.
#[derive(Debug, Clone, Default)]
pub struct PacketSet {
    import_table: Option<ImportTablePacket>,
    destination: Option<DestinationPacket>,
    columns: Option<DataColumnsPacket>,
    format: Option<DataFormatPacket>,
    complete: bool,
    unload: Option<DataUnloadPacket>,
    loads: Vec<DataLoadPacket>,
    files: Vec<DataFilePacket>,
}

impl PacketSet {
    pub fn add(&mut self, packet: Packet) {
        match packet {
            Packet::ImportTable(packet) => self.import_table = Some(packet),
            Packet::Destination(packet) => self.destination = Some(packet),
            Packet::DataColumns(packet) => self.columns = Some(packet),
            Packet::DataFormat(packet) => self.format = Some(packet),
            Packet::DataLoad(packet) => self.loads.push(packet),
            Packet::DataFile(packet) => self.files.push(packet),
            Packet::DataComplete => self.complete = true,
            Packet::DataUnload(packet) => self.unload = Some(packet),
        }
    }

    pub fn contains(&self, kind: PacketKind) -> bool {
        match kind {
            PacketKind::ImportTable => self.import_table.is_some(),
            PacketKind::Destination => self.destination.is_some(),
            PacketKind::DataColumns => self.columns.is_some(),
            PacketKind::DataFormat => self.format.is_some(),
            PacketKind::DataLoad => !self.loads.is_empty(),
            PacketKind::DataFile => !self.files.is_empty(),
            PacketKind::DataComplete => self.complete,
            PacketKind::DataUnload => self.unload.is_some(),
        }
    }

    pub fn contains_any(&self, kinds: &[PacketKind]) -> bool {
        kinds.iter().any(|kind| self.contains(*kind))
    }

    pub fn import_table(&self) -> Result<&ImportTablePacket, Error> {
        self.import_table
            .as_ref()
            .ok_or(Error::MissingPacket(PacketKind::ImportTable.as_str()))
    }

    pub fn import_table_mut(&mut self) -> Result<&mut ImportTablePacket, Error> {
        self.import_table
            .as_mut()
            .ok_or(Error::MissingPacket(PacketKind::ImportTable.as_str()))
    }

    pub fn destination(&self) -> Result<&DestinationPacket, Error> {
        self.destination
            .as_ref()
            .ok_or(Error::MissingPacket(PacketKind::Destination.as_str()))
    }

    pub fn format(&self) -> Result<&DataFormatPacket, Error> {
        self.format
            .as_ref()
            .ok_or(Error::MissingPacket(PacketKind::DataFormat.as_str()))
    }

    pub fn columns(&self) -> Option<&DataColumnsPacket> {
        self.columns.as_ref()
    }

    pub fn unload(&self) -> Option<&DataUnloadPacket> {
        self.unload.as_ref()
    }

    pub fn take_unload(&mut self) -> Option<DataUnloadPacket> {
        self.unload.take()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn loads(&self) -> &[DataLoadPacket] {
        &self.loads
    }

    pub fn files(&self) -> &[DataFilePacket] {
        &self.files
    }

    /// Remove and return every `DataLoad` packet.
    pub fn pop_loads(&mut self) -> Vec<DataLoadPacket> {
        std::mem::take(&mut self.loads)
    }

    /// Remove and return every `DataFile` packet.
    pub fn pop_files(&mut self) -> Vec<DataFilePacket> {
        std::mem::take(&mut self.files)
    }

    /// The singleton packets a child message inherits from its parent.
    pub(crate) fn singletons(&self) -> PacketSet {
        PacketSet {
            import_table: self.import_table.clone(),
            destination: self.destination.clone(),
            columns: self.columns.clone(),
            format: self.format.clone(),
            ..PacketSet::default()
        }
    }

    /// The kinds currently present, for logging.
    pub fn kinds(&self) -> Vec<PacketKind> {
        ALL_PACKETS
            .iter()
            .copied()
            .filter(|kind| self.contains(*kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use sluice_core::RowFormat;

    use super::*;

    #[test]
    fn singleton_packets_replace_each_other() {
        let mut packets = PacketSet::default();
        packets.add(Packet::DataFormat(DataFormatPacket {
            format: RowFormat::default(),
        }));
        packets.add(Packet::DataFormat(DataFormatPacket {
            format: RowFormat::new(",", "\n", "'"),
        }));

        assert_eq!(packets.format().unwrap().format.field_terminator, ",");
    }

    #[test]
    fn missing_singleton_lookup_fails() {
        let packets = PacketSet::default();

        match packets.import_table() {
            Err(Error::MissingPacket(kind)) => assert_eq!(kind, "ImportTable"),
            other => panic!("expected MissingPacket, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn data_loads_accumulate_in_order() {
        let mut packets = PacketSet::default();
        for index in 0..3 {
            packets.add(Packet::DataLoad(DataLoadPacket {
                data: format!("{}\n", index),
                index,
                rows: 1,
            }));
        }

        let indices: Vec<usize> = packets.loads().iter().map(|load| load.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        let popped = packets.pop_loads();
        assert_eq!(popped.len(), 3);
        assert!(packets.loads().is_empty());
    }

    #[test]
    fn singletons_copy_excludes_data_packets() {
        let mut packets = PacketSet::default();
        packets.add(Packet::DataFormat(DataFormatPacket {
            format: RowFormat::default(),
        }));
        packets.add(Packet::DataLoad(DataLoadPacket {
            data: "1\n".to_string(),
            index: 0,
            rows: 1,
        }));
        packets.add(Packet::DataComplete);

        let copied = packets.singletons();
        assert!(copied.contains(PacketKind::DataFormat));
        assert!(!copied.contains(PacketKind::DataLoad));
        assert!(!copied.contains(PacketKind::DataComplete));
    }

    #[test]
    fn contains_any_matches_present_kinds() {
        let mut packets = PacketSet::default();
        packets.add(Packet::DataComplete);

        assert!(packets.contains_any(&[PacketKind::DataLoad, PacketKind::DataComplete]));
        assert!(!packets.contains_any(&[PacketKind::DataLoad, PacketKind::DataFile]));
    }
}
