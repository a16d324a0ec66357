// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! MBR partition lookup, for exporting a single partition of a disk image.

use block::{BlockLayer, HandleId, SECTOR_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use thiserror::Error;

const MBR_TABLE_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;
const MBR_SIGNATURE: [u8; 2] = [0x55, 0xaa];

const PART_TYPE_EXTENDED: u8 = 0x05;
const PART_TYPE_EXTENDED_LBA: u8 = 0x0f;

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("Failed to read partition table")]
    Read(#[source] block::Error),
    #[error("No MBR signature found")]
    NoSignature,
    #[error("Partition {0} not found")]
    NotFound(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PartitionRecord {
    system: u8,
    start_sector: u32,
    nb_sectors: u32,
}

impl PartitionRecord {
    fn parse(entry: &[u8]) -> Self {
        PartitionRecord {
            system: entry[4],
            start_sector: LittleEndian::read_u32(&entry[8..12]),
            nb_sectors: LittleEndian::read_u32(&entry[12..16]),
        }
    }

    fn is_extended(&self) -> bool {
        matches!(self.system, PART_TYPE_EXTENDED | PART_TYPE_EXTENDED_LBA)
    }
}

fn read_table(
    layer: &mut BlockLayer,
    id: HandleId,
    sector: u64,
) -> Result<[PartitionRecord; 4], PartitionError> {
    let mut data = [0u8; SECTOR_SIZE as usize];
    layer
        .read(id, sector, &mut data)
        .map_err(PartitionError::Read)?;
    if data[510..512] != MBR_SIGNATURE {
        return Err(PartitionError::NoSignature);
    }

    Ok(std::array::from_fn(|i| {
        let start = MBR_TABLE_OFFSET + i * MBR_ENTRY_SIZE;
        PartitionRecord::parse(&data[start..start + MBR_ENTRY_SIZE])
    }))
}

/// Byte offset and length of partition `partition` of the image.
///
/// Primary partitions are numbered 1 to 4 in table order. The entries of an
/// extended partition's boot record are numbered from 5, four numbers per
/// extended partition, and their start is relative to that record.
pub fn find_partition(
    layer: &mut BlockLayer,
    id: HandleId,
    partition: u32,
) -> Result<(u64, u64), PartitionError> {
    let mbr = read_table(layer, id, 0)?;
    let mut ext_partnum = 4;

    for (i, record) in mbr.iter().enumerate() {
        if record.nb_sectors == 0 {
            continue;
        }

        if record.is_extended() {
            let ebr_sector = u64::from(record.start_sector);
            let ebr = read_table(layer, id, ebr_sector)?;
            for (j, ext) in ebr.iter().enumerate() {
                if ext.nb_sectors == 0 {
                    continue;
                }
                if ext_partnum + j as u32 + 1 == partition {
                    let start = ebr_sector + u64::from(ext.start_sector);
                    debug!("Partition {partition} is logical, starting at sector {start}");
                    return Ok((start * SECTOR_SIZE, u64::from(ext.nb_sectors) * SECTOR_SIZE));
                }
            }
            ext_partnum += 4;
        } else if i as u32 + 1 == partition {
            return Ok((
                u64::from(record.start_sector) * SECTOR_SIZE,
                u64::from(record.nb_sectors) * SECTOR_SIZE,
            ));
        }
    }

    Err(PartitionError::NotFound(partition))
}
