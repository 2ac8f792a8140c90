use std::collections::VecDeque;

use super::handle::EntityHandle;
use super::snapshot::DirtyFields;

/// Id of one snapshot datagram body built by a flush. Ids grow by one per
/// datagram and wrap.
pub type DatagramId = u32;

#[derive(Debug)]
struct DatagramRecord {
    id: DatagramId,
    entries: Vec<(EntityHandle, DirtyFields)>,
}

/// Remembers which entity fields each recent snapshot datagram carried, so
/// the fields of a datagram a peer never received can be sent again.
///
/// The log is bounded. A datagram reported lost after its record was
/// evicted is not repaired here; the periodic full sync covers it.
#[derive(Debug)]
pub struct DeliveryLog {
    records: VecDeque<DatagramRecord>,
    capacity: usize,
    next_id: DatagramId,
}

impl DeliveryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            next_id: 0,
        }
    }

    /// Starts the record for a new datagram, recycling the oldest one when full.
    pub fn open(&mut self) -> DatagramId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let mut entries = if self.records.len() >= self.capacity {
            self.records
                .pop_front()
                .map(|record| record.entries)
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        entries.clear();
        self.records.push_back(DatagramRecord { id, entries });
        id
    }

    /// Notes that the most recently opened datagram carries `fields` of `handle`.
    pub fn record(&mut self, handle: EntityHandle, fields: DirtyFields) {
        if let Some(record) = self.records.back_mut() {
            record.entries.push((handle, fields));
        }
    }

    /// Forgets the newest record, for a datagram that was opened but never filled.
    pub fn discard_last(&mut self, id: DatagramId) {
        if self.records.back().is_some_and(|record| record.id == id) {
            self.records.pop_back();
        }
    }

    pub fn entries(&self, id: DatagramId) -> Option<&[(EntityHandle, DirtyFields)]> {
        let front = self.records.front()?.id;
        let index = id.wrapping_sub(front) as usize;
        self.records
            .get(index)
            .filter(|record| record.id == id)
            .map(|record| record.entries.as_slice())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: u16) -> EntityHandle {
        EntityHandle::new(id, 1)
    }

    #[test]
    fn records_land_in_the_newest_datagram() {
        let mut log = DeliveryLog::new(8);
        let first = log.open();
        log.record(handle(0), DirtyFields::POSITION);
        let second = log.open();
        log.record(handle(1), DirtyFields::ROTATION);
        log.record(handle(2), DirtyFields::TRANSFORM);

        assert_eq!(log.entries(first), Some(&[(handle(0), DirtyFields::POSITION)][..]));
        assert_eq!(log.entries(second).map(<[_]>::len), Some(2));
    }

    #[test]
    fn oldest_records_are_recycled() {
        let mut log = DeliveryLog::new(2);
        let first = log.open();
        log.record(handle(0), DirtyFields::POSITION);
        log.open();
        let third = log.open();

        assert_eq!(log.len(), 2);
        assert_eq!(log.entries(first), None);
        assert_eq!(log.entries(third), Some(&[][..]));
    }

    #[test]
    fn discarding_only_touches_the_named_record() {
        let mut log = DeliveryLog::new(4);
        let first = log.open();
        let second = log.open();

        log.discard_last(first);
        assert_eq!(log.len(), 2);
        log.discard_last(second);
        assert_eq!(log.len(), 1);
        assert!(log.entries(second).is_none());
    }

    #[test]
    fn ids_survive_wraparound() {
        let mut log = DeliveryLog::new(4);
        log.next_id = u32::MAX;
        let last = log.open();
        log.record(handle(3), DirtyFields::VELOCITY);
        let wrapped = log.open();

        assert_eq!(wrapped, 0);
        assert_eq!(log.entries(last), Some(&[(handle(3), DirtyFields::VELOCITY)][..]));
        assert_eq!(log.entries(wrapped), Some(&[][..]));
    }
}
