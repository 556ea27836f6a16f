//! The in-memory coverage store of the collector.
//!
//! Objects are kept in an arena and indexed by a closed-addressing hash table keyed by `(peer, filename)`. Functions
//! are kept in a per-object arena in the order they were first seen.

use error::*;
use raw::*;

use std::cmp;
use std::collections::HashMap;
use std::ops::{Index, IndexMut};

/// Number of slots of the object hash table.
pub const HASH_SLOTS: usize = 11_113;

/// Computes the hash table slot of `(peer, filename)`.
pub fn hash_slot(peer: u32, filename: &str) -> usize {
    let mut ret = peer;
    let mut ctr = 0;
    for b in filename.bytes() {
        ret ^= u32::from(b) << ctr;
        ctr = (ctr + 1) % 8;
    }
    ret as usize % HASH_SLOTS
}

#[test]
fn test_hash_slot() {
    assert_eq!(hash_slot(7, ""), 7);
    // 7 ^ 'a' ^ ('b' << 1)
    assert_eq!(hash_slot(7, "ab"), (7 ^ 0x61 ^ 0xc4) % HASH_SLOTS);
    assert_ne!(hash_slot(7, "foo.c"), hash_slot(8, "foo.c"));
    assert!(hash_slot(u32::max_value(), "foo.c") < HASH_SLOTS);
}

//----------------------------------------------------------------------------------------------------------------------
//{{{ Store

/// Handle of an object inside the [`Store`].
///
/// [`Store`]: ./struct.Store.html
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ObjectIndex(usize);

/// The coverage store, mapping `(peer, filename)` to the merged object information.
#[derive(Clone, Debug)]
pub struct Store {
    buckets: Vec<Vec<ObjectIndex>>,
    objects: Vec<ObjectInfo>,
}

impl Default for Store {
    fn default() -> Store {
        Store {
            buckets: vec![Vec::new(); HASH_SLOTS],
            objects: Vec::new(),
        }
    }
}

impl Store {
    /// Creates an empty store.
    pub fn new() -> Store {
        Store::default()
    }

    /// Whether the store contains no objects.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// All objects, in the order they were created.
    pub fn objects(&self) -> &[ObjectInfo] {
        &self.objects
    }

    /// Drops every object.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.objects.clear();
    }

    /// Finds the object of `(peer, filename)`.
    pub fn find(&self, peer: u32, filename: &str) -> Option<ObjectIndex> {
        self.buckets[hash_slot(peer, filename)]
            .iter()
            .cloned()
            .find(|&index| self[index].peer == peer && self[index].header.filename == filename)
    }

    /// Obtains the object of `(peer, header.filename)`, creating it if this is the first sighting.
    ///
    /// # Errors
    ///
    /// Returns [`IncompatibleReinstrumentation`] if the object exists with a different version, stamp, checksum or
    /// counter mask.
    ///
    /// [`IncompatibleReinstrumentation`]: ../error/enum.ErrorKind.html#variant.IncompatibleReinstrumentation
    pub fn get_or_create(&mut self, peer: u32, header: &ObjectHeader) -> Result<ObjectIndex> {
        if let Some(index) = self.find(peer, &header.filename) {
            let object = &mut self[index];
            ensure!(
                object.header.same_instrumentation(header),
                ErrorKind::IncompatibleReinstrumentation(peer, header.filename.clone())
            );
            object.header.n_functions = cmp::max(object.header.n_functions, header.n_functions);
            return Ok(index);
        }

        let index = ObjectIndex(self.objects.len());
        debug!("new object #{} for peer {}: {}", index.0, peer, header.filename);
        self.objects.push(ObjectInfo::new(peer, header.clone()));
        self.buckets[hash_slot(peer, &header.filename)].push(index);
        Ok(index)
    }

    /// Merges the summaries of the `position`-th summable counter type into the object.
    pub fn merge_summary(&mut self, index: ObjectIndex, position: usize, object: &Summary, program: &Summary) {
        if let Some(&mut (ref mut o, ref mut p)) = self[index].summaries.get_mut(position) {
            o.merge_run(object);
            p.merge_run(program);
        }
    }

    /// Merges a complete function record into the object.
    ///
    /// The store is only modified when the whole record is consistent with the previous sightings of the function.
    ///
    /// # Errors
    ///
    /// * Returns [`ChecksumMismatch`] if the function was seen with a different checksum.
    /// * Returns [`CountsMismatch`] if the number of counters of some type differs from the previous sighting.
    /// * Returns [`Protocol`] if the record does not have one counter array per enabled counter type.
    ///
    /// [`ChecksumMismatch`]: ../error/enum.ErrorKind.html#variant.ChecksumMismatch
    /// [`CountsMismatch`]: ../error/enum.ErrorKind.html#variant.CountsMismatch
    /// [`Protocol`]: ../error/enum.ErrorKind.html#variant.Protocol
    pub fn merge_function(&mut self, index: ObjectIndex, record: FunctionRecord) -> Result<()> {
        self[index].merge_function(record)
    }
}

impl Index<ObjectIndex> for Store {
    type Output = ObjectInfo;
    fn index(&self, index: ObjectIndex) -> &ObjectInfo {
        &self.objects[index.0]
    }
}

impl IndexMut<ObjectIndex> for Store {
    fn index_mut(&mut self, index: ObjectIndex) -> &mut ObjectInfo {
        &mut self.objects[index.0]
    }
}

//}}}
//----------------------------------------------------------------------------------------------------------------------
//{{{ ObjectInfo

/// The merged coverage of one source file of one peer.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ObjectInfo {
    pub peer: u32,
    pub header: ObjectHeader,
    /// Object and program summaries, one pair per enabled summable counter type.
    pub summaries: Vec<(Summary, Summary)>,
    /// Functions in the order they were first seen.
    pub functions: Vec<FunctionInfo>,
    #[cfg_attr(feature = "serde", serde(skip))]
    function_index: HashMap<Ident, usize>,
}

impl ObjectInfo {
    fn new(peer: u32, header: ObjectHeader) -> ObjectInfo {
        ObjectInfo {
            peer,
            summaries: vec![Default::default(); header.ctr_mask.summable_types().len()],
            header,
            functions: Vec::new(),
            function_index: HashMap::new(),
        }
    }

    /// Finds a function by its identifier.
    pub fn function(&self, ident: Ident) -> Option<&FunctionInfo> {
        self.function_index.get(&ident).map(|&i| &self.functions[i])
    }

    fn merge_function(&mut self, record: FunctionRecord) -> Result<()> {
        let types = self.header.ctr_mask.types();
        ensure!(
            record.counters.len() == types.len(),
            ErrorKind::Protocol(format!("function {} has {} counter arrays", record.ident, record.counters.len()))
        );
        for &(ref policy, ref values) in &record.counters {
            policy.check_count(values.len())?;
        }

        if let Some(&i) = self.function_index.get(&record.ident) {
            let function = &mut self.functions[i];
            ensure!(
                function.checksum == record.checksum,
                ErrorKind::ChecksumMismatch(record.ident, function.checksum, record.checksum)
            );
            for (array, &(_, ref values)) in function.counters.iter().zip(&record.counters) {
                ensure!(
                    array.values.len() == values.len(),
                    ErrorKind::CountsMismatch(array.ty, array.values.len(), values.len())
                );
            }
            // Compute everything before committing, so an overflow leaves the function untouched.
            let merged = function
                .counters
                .iter()
                .zip(&record.counters)
                .map(|(array, &(ref policy, ref values))| array.merged(policy, values))
                .collect::<Result<Vec<_>>>()?;
            for ((array, (policy, _)), values) in function.counters.iter_mut().zip(record.counters).zip(merged) {
                array.policy = policy;
                array.values = values;
            }
            return Ok(());
        }

        let counters = types
            .into_iter()
            .zip(record.counters)
            .map(|(ty, (policy, values))| CounterArray { ty, policy, values })
            .collect();
        self.function_index.insert(record.ident, self.functions.len());
        self.functions.push(FunctionInfo {
            ident: record.ident,
            checksum: record.checksum,
            counters,
        });
        Ok(())
    }
}

/// A complete function record as read from a peer, before it is merged into the store.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FunctionRecord {
    pub ident: Ident,
    pub checksum: u32,
    /// Counter arrays, one per enabled counter type in mask order.
    pub counters: Vec<(MergePolicy, Vec<i64>)>,
}

//}}}
//----------------------------------------------------------------------------------------------------------------------
//{{{ FunctionInfo & CounterArray

/// The merged counters of a function.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct FunctionInfo {
    pub ident: Ident,
    pub checksum: u32,
    /// Counter arrays, one per enabled counter type in mask order.
    pub counters: Vec<CounterArray>,
}

/// Counters of a single counter type.
///
/// Under the `single` policy the values are `(value, count, seen)` triples, and under `delta` they are
/// `(last, accumulated)` pairs. These tuples are dumped as they are.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct CounterArray {
    pub ty: CounterType,
    pub policy: MergePolicy,
    /// Counter values. Its length never changes after creation.
    pub values: Vec<i64>,
}

impl CounterArray {
    /// Computes the values after merging another sighting of the counters, without modifying the array.
    ///
    /// A sighting under a different policy replaces the values.
    fn merged(&self, policy: &MergePolicy, values: &[i64]) -> Result<Vec<i64>> {
        if *policy != self.policy {
            warn!("{} counters switch merge policy from {} to {}", self.ty, self.policy, policy);
            return Ok(values.to_vec());
        }
        self.policy.merge(&self.values, values)
    }
}

//}}}
//----------------------------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn header(filename: &str, mask: CounterMask) -> ObjectHeader {
        ObjectHeader {
            filename: filename.to_owned(),
            version: Version(1),
            stamp: 0,
            checksum: 0,
            program_checksum: 0,
            n_functions: 1,
            ctr_mask: mask,
        }
    }

    fn record(ident: u32, counters: Vec<(MergePolicy, Vec<i64>)>) -> FunctionRecord {
        FunctionRecord {
            ident: Ident(ident),
            checksum: 0,
            counters,
        }
    }

    #[test]
    fn test_add_merge() {
        let mut store = Store::new();
        let h = header("foo.c", CounterMask::ARCS);
        let a = store.get_or_create(7, &h).unwrap();
        store.merge_function(a, record(1, vec![(MergePolicy::Add, vec![1, 2, 3])])).unwrap();
        let b = store.get_or_create(7, &h).unwrap();
        assert_eq!(a, b);
        store.merge_function(b, record(1, vec![(MergePolicy::Add, vec![10, 20, 30])])).unwrap();
        assert_eq!(store.objects().len(), 1);
        assert_eq!(store[a].functions[0].counters[0].values, vec![11, 22, 33]);
    }

    #[test]
    fn test_peers_are_separate() {
        let mut store = Store::new();
        let h = header("foo.c", CounterMask::ARCS);
        let a = store.get_or_create(7, &h).unwrap();
        let b = store.get_or_create(8, &h).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.find(8, "foo.c"), Some(b));
        assert_eq!(store.find(9, "foo.c"), None);
    }

    #[test]
    fn test_incompatible_reinstrumentation() {
        let mut store = Store::new();
        store.get_or_create(7, &header("foo.c", CounterMask::ARCS)).unwrap();
        let mut other = header("foo.c", CounterMask::ARCS);
        other.stamp = 1;
        match *store.get_or_create(7, &other).unwrap_err().kind() {
            ErrorKind::IncompatibleReinstrumentation(7, ref f) if f == "foo.c" => {},
            ref e => panic!("unexpected error {:?}", e),
        }
        let e = store.get_or_create(7, &header("foo.c", CounterMask::ARCS | CounterMask::SINGLE)).unwrap_err();
        assert!(e.kind().is_record_local());
    }

    #[test]
    fn test_mismatched_function_leaves_store_intact() {
        let mut store = Store::new();
        let o = store.get_or_create(7, &header("foo.c", CounterMask::ARCS | CounterMask::SINGLE)).unwrap();
        store
            .merge_function(o, record(1, vec![(MergePolicy::Add, vec![1, 2]), (MergePolicy::Single, vec![4, 1, 1])]))
            .unwrap();
        let before = store[o].functions.clone();

        let e = store
            .merge_function(
                o,
                record(1, vec![(MergePolicy::Add, vec![1, 2]), (MergePolicy::Single, vec![4, 1, 1, 4, 1, 1])]),
            )
            .unwrap_err();
        match *e.kind() {
            ErrorKind::CountsMismatch(CounterType::Single, 3, 6) => {},
            ref e => panic!("unexpected error {:?}", e),
        }

        let mut bad_checksum = record(1, vec![(MergePolicy::Add, vec![1, 2]), (MergePolicy::Single, vec![4, 1, 1])]);
        bad_checksum.checksum = 99;
        match *store.merge_function(o, bad_checksum).unwrap_err().kind() {
            ErrorKind::ChecksumMismatch(Ident(1), 0, 99) => {},
            ref e => panic!("unexpected error {:?}", e),
        }

        let incomplete = record(1, vec![(MergePolicy::Add, vec![1, 2]), (MergePolicy::Single, vec![4, 1])]);
        match *store.merge_function(o, incomplete).unwrap_err().kind() {
            ErrorKind::IncompleteTuple(_, 3, 2) => {},
            ref e => panic!("unexpected error {:?}", e),
        }

        assert_eq!(store[o].functions, before);
    }

    #[test]
    fn test_overflow_leaves_function_intact() {
        let mut store = Store::new();
        let o = store.get_or_create(7, &header("foo.c", CounterMask::ARCS | CounterMask::SINGLE)).unwrap();
        let big = record(1, vec![(MergePolicy::Add, vec![1, i64::max_value()]), (MergePolicy::Single, vec![4, 1, 1])]);
        store.merge_function(o, big.clone()).unwrap();
        let before = store[o].functions.clone();

        let e = store.merge_function(o, big).unwrap_err();
        match *e.kind() {
            ErrorKind::CounterOverflow => {},
            ref e => panic!("unexpected error {:?}", e),
        }
        assert!(e.kind().is_record_local());
        assert_eq!(store[o].functions, before);
    }

    #[test]
    fn test_single_value_vote() {
        let mut store = Store::new();
        let o = store.get_or_create(7, &header("foo.c", CounterMask::SINGLE)).unwrap();
        for &value in &[5, 5, 5, 7, 5] {
            store.merge_function(o, record(1, vec![(MergePolicy::Single, vec![value, 1, 1, 9, 1, 1])])).unwrap();
        }
        assert_eq!(store[o].functions[0].counters[0].values, vec![5, 3, 5, 9, 5, 5]);
    }

    #[test]
    fn test_single_value_candidate_replaced() {
        let mut store = Store::new();
        let o = store.get_or_create(7, &header("foo.c", CounterMask::SINGLE)).unwrap();
        for &value in &[5, 7, 7] {
            store.merge_function(o, record(1, vec![(MergePolicy::Single, vec![value, 1, 1])])).unwrap();
        }
        assert_eq!(store[o].functions[0].counters[0].values, vec![7, 1, 3]);
    }

    #[test]
    fn test_delta_accumulates() {
        let mut store = Store::new();
        let o = store.get_or_create(7, &header("foo.c", CounterMask::DELTA)).unwrap();
        store.merge_function(o, record(1, vec![(MergePolicy::Delta, vec![10, 3])])).unwrap();
        store.merge_function(o, record(1, vec![(MergePolicy::Delta, vec![18, 5])])).unwrap();
        let array = &store[o].functions[0].counters[0];
        assert_eq!(array.values, vec![18, 8]);
    }

    #[test]
    fn test_policy_switch_replaces() {
        let mut store = Store::new();
        let o = store.get_or_create(7, &header("foo.c", CounterMask::SINGLE)).unwrap();
        store.merge_function(o, record(1, vec![(MergePolicy::Single, vec![5, 2, 2])])).unwrap();
        store.merge_function(o, record(1, vec![(MergePolicy::Add, vec![1, 1, 1])])).unwrap();
        let array = &store[o].functions[0].counters[0];
        assert_eq!(array.policy, MergePolicy::Add);
        assert_eq!(array.values, vec![1, 1, 1]);
    }

    #[test]
    fn test_unknown_policy_replaces() {
        let mut store = Store::new();
        let o = store.get_or_create(7, &header("foo.c", CounterMask::POW2)).unwrap();
        let ior = MergePolicy::Unknown("ior".to_owned());
        store.merge_function(o, record(1, vec![(ior.clone(), vec![1, 2])])).unwrap();
        store.merge_function(o, record(1, vec![(ior.clone(), vec![3, 0])])).unwrap();
        let array = &store[o].functions[0].counters[0];
        assert_eq!(array.policy, ior);
        assert_eq!(array.values, vec![3, 0]);
    }

    #[test]
    fn test_merge_summary() {
        let mut store = Store::new();
        let o = store.get_or_create(7, &header("foo.c", CounterMask::ARCS)).unwrap();
        let s = Summary { num: 1, runs: 1, sum_all: 5, run_max: 5, sum_max: 5 };
        store.merge_summary(o, 0, &s, &s);
        store.merge_summary(o, 0, &s, &s);
        let expected = Summary { num: 1, runs: 2, sum_all: 10, run_max: 5, sum_max: 10 };
        assert_eq!(store[o].summaries, vec![(expected, expected)]);
    }

    #[test]
    fn test_clear() {
        let mut store = Store::new();
        store.get_or_create(7, &header("foo.c", CounterMask::ARCS)).unwrap();
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.find(7, "foo.c"), None);
    }
}
