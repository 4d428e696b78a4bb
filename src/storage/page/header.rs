use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, PAGE_SIZE};

const COUNT_OFFSET: usize = 0;
const COUNT_SIZE: usize = 4;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4; // name + root page id
const MAX_RECORDS: usize = (PAGE_SIZE - COUNT_SIZE) / RECORD_SIZE;

/// The header page (page 0) stores one record per index: a
/// fixed-width name and the index's current root page id. It is
/// rewritten on every root change.
///
/// Layout: [record_count: u32 | (name[32], root_page_id: u32)*]
pub struct HeaderPage;

impl HeaderPage {
    /// Number of records currently stored
    pub fn record_count(page: &Page) -> usize {
        LittleEndian::read_u32(&page.data[COUNT_OFFSET..COUNT_OFFSET + COUNT_SIZE]) as usize
    }

    /// Insert a record <name, root_page_id>. Returns false if the name
    /// is already present, too long, or the page is full.
    pub fn insert_record(page: &mut Page, name: &str, root_page_id: PageId) -> bool {
        if name.len() > NAME_SIZE || Self::find_record(page, name).is_some() {
            return false;
        }
        let count = Self::record_count(page);
        if count >= MAX_RECORDS {
            return false;
        }

        let offset = Self::record_offset(count);
        page.data[offset..offset + NAME_SIZE].fill(0);
        page.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        LittleEndian::write_u32(&mut page.data[offset + NAME_SIZE..offset + RECORD_SIZE], root_page_id);

        LittleEndian::write_u32(
            &mut page.data[COUNT_OFFSET..COUNT_OFFSET + COUNT_SIZE],
            (count + 1) as u32,
        );
        true
    }

    /// Update the root page id stored for the given name. Returns
    /// false if the name is not present.
    pub fn update_record(page: &mut Page, name: &str, root_page_id: PageId) -> bool {
        match Self::find_record(page, name) {
            Some(idx) => {
                let offset = Self::record_offset(idx);
                LittleEndian::write_u32(
                    &mut page.data[offset + NAME_SIZE..offset + RECORD_SIZE],
                    root_page_id,
                );
                true
            }
            None => false,
        }
    }

    /// Look up the root page id stored for the given name
    pub fn get_record_value(page: &Page, name: &str) -> Option<PageId> {
        Self::find_record(page, name).map(|idx| {
            let offset = Self::record_offset(idx);
            LittleEndian::read_u32(&page.data[offset + NAME_SIZE..offset + RECORD_SIZE])
        })
    }

    /// Remove the record for the given name, compacting the remainder.
    /// Returns false if the name is not present.
    pub fn delete_record(page: &mut Page, name: &str) -> bool {
        let idx = match Self::find_record(page, name) {
            Some(idx) => idx,
            None => return false,
        };
        let count = Self::record_count(page);

        // Shift the trailing records down one slot
        let start = Self::record_offset(idx + 1);
        let end = Self::record_offset(count);
        page.data.copy_within(start..end, Self::record_offset(idx));

        LittleEndian::write_u32(
            &mut page.data[COUNT_OFFSET..COUNT_OFFSET + COUNT_SIZE],
            (count - 1) as u32,
        );
        true
    }

    fn record_offset(idx: usize) -> usize {
        COUNT_SIZE + idx * RECORD_SIZE
    }

    fn find_record(page: &Page, name: &str) -> Option<usize> {
        let count = Self::record_count(page);
        (0..count).find(|&idx| {
            let offset = Self::record_offset(idx);
            let stored = &page.data[offset..offset + NAME_SIZE];
            let stored_name = &stored[..stored.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE)];
            stored_name == name.as_bytes()
        })
    }
}
