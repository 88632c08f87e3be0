// This module is the storage-layout planner: it maps every declared script global to
// backend storage before any code is lowered. Scalar longs and strings are bucketed
// into one shared array map per primitive type, each variable taking the next element
// index; arrays get a dedicated hash map keyed by their (possibly composite) index
// tuple; statistics-valued variables get one per-cpu map per tracked stat field, with
// all scalar aggregates sharing a common element index across those maps and each
// array aggregate receiving its own map set plus a nonzero aggregate id. Two internal
// maps always come first: the exit-flag/error-counter hash and the perf-event
// transport array. The module also owns the side tables referenced by numeric index
// from emitted code: interned format strings and per-loop foreach sort descriptors,
// along with their 5-word wire encoding shared with the userspace runtime.

//! Storage layout planning for script globals.

use hashbrown::HashMap;

use crate::ast::{GlobalVar, IndexType, ValueType};
use crate::ir::{BPF_MAXMAPENTRIES, BPF_MAXSTRINGLEN};

// Kernel bpf_map_type numbers used in emitted map definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MapKind {
    Hash = 1,
    Array = 2,
    PerfEventArray = 4,
    PercpuHash = 5,
    PercpuArray = 6,
}

/// One fixed-size map definition record in the emitted "maps" section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapDef {
    pub kind: MapKind,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
}

/// Storage slot of one script global: a (map, index) pair. A negative map id
/// marks a statistics aggregate (resolved through the per-field stat tables
/// instead); a negative index marks a non-scalar (array) variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapSlot {
    pub map_id: i64,
    pub idx: i64,
}

impl MapSlot {
    pub fn new(map_id: i64, idx: i64) -> Self {
        Self { map_id, idx }
    }

    pub fn is_stat(&self) -> bool {
        self.map_id < 0
    }

    pub fn is_array(&self) -> bool {
        self.idx < 0
    }
}

/// Index of the internal exit/errors map; always allocated first.
pub const INTERNAL_MAP_IDX: usize = 0;
/// Index of the perf-event transport map; always allocated second.
pub const PERF_EVENT_MAP_IDX: usize = 1;

/// Element indices within the internal map.
pub const EXIT_SLOT: i64 = 0;
pub const ERRORS_SLOT: i64 = 1;
pub const NUM_INTERNALS: u32 = 2;

/// Patched to the real CPU count by the loader.
pub const NUM_CPUS_PLACEHOLDER: u32 = 0;

/// Per-cpu statistics fields tracked for every aggregate.
pub type StatField = &'static str;
pub const STAT_FIELDS: &[StatField] = &["count", "sum"];

/// The field whose map is used when iterating keys or testing inclusion.
pub const STAT_ITER_FIELD: StatField = "count";

/// field -> map id association for one aggregate's map set.
pub type StatsMap = HashMap<StatField, usize>;

/// A stats map flattened to one map id per entry of [`STAT_FIELDS`], in
/// field-list order; the serialized form used in the aggregates section.
pub type InternedStatsMap = Vec<u64>;

pub fn intern_stats_map(sm: &StatsMap) -> InternedStatsMap {
    STAT_FIELDS
        .iter()
        .map(|f| sm[f] as u64)
        .collect()
}

pub fn deintern_stats_map(ism: &InternedStatsMap) -> StatsMap {
    STAT_FIELDS
        .iter()
        .zip(ism.iter())
        .map(|(&f, &id)| (f, id as usize))
        .collect()
}

/// Statically recorded layout of one foreach loop, applied by the userspace
/// runtime when the loop requests sorted iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ForeachInfo {
    /// 0 unsorted, positive ascending, negative descending.
    pub sort_direction: i64,
    /// 1-based key column to sort by; 0 means sort by value.
    pub sort_column: u64,
    /// Total composite key size in bytes.
    pub keysize: u64,
    /// Size in bytes of the sort column.
    pub sort_column_size: u64,
    /// Byte offset of the sort column within the key.
    pub sort_column_ofs: i64,
}

pub const N_FOREACH_INFO_FIELDS: usize = 5;

pub fn intern_foreach_info(fi: &ForeachInfo) -> [u64; N_FOREACH_INFO_FIELDS] {
    [
        fi.sort_direction as u64,
        fi.sort_column,
        fi.keysize,
        fi.sort_column_size,
        fi.sort_column_ofs as u64,
    ]
}

pub fn deintern_foreach_info(ifi: &[u64; N_FOREACH_INFO_FIELDS]) -> ForeachInfo {
    ForeachInfo {
        sort_direction: ifi[0] as i64,
        sort_column: ifi[1],
        keysize: ifi[2],
        sort_column_size: ifi[3],
        sort_column_ofs: ifi[4] as i64,
    }
}

/// Planned storage layout for one translation pass.
#[derive(Debug, Default)]
pub struct Globals {
    /// Map definitions in allocation order; ids are indices into this list.
    pub maps: Vec<MapDef>,
    /// Variable name -> storage slot.
    slots: HashMap<String, MapSlot>,
    /// Shared per-field maps for all scalar aggregates.
    pub scalar_stats: StatsMap,
    /// Per-field map set of each array aggregate, in declaration order.
    pub array_stats: Vec<(String, StatsMap)>,
    /// Aggregate ids; 0 is reserved for the shared scalar set.
    aggregates: HashMap<String, u64>,
    /// Declared key layout and element type of each array global; iteration
    /// and whole-array deletion need the per-column types.
    arrays: HashMap<String, (Vec<IndexType>, ValueType)>,
    /// Interned transport format strings, referenced by index from code.
    pub interned_strings: Vec<String>,
    interned_str_map: HashMap<String, usize>,
    /// Per-loop foreach descriptors, referenced by index from code.
    pub foreach_loop_info: Vec<ForeachInfo>,
}

impl Globals {
    /// Create the layout with only the internal maps allocated.
    pub fn new() -> Self {
        let mut glob = Globals::default();

        glob.slots.insert(
            "__STAPBPF_exit".to_string(),
            MapSlot::new(INTERNAL_MAP_IDX as i64, EXIT_SLOT),
        );
        glob.slots.insert(
            "__STAPBPF_errors".to_string(),
            MapSlot::new(INTERNAL_MAP_IDX as i64, ERRORS_SLOT),
        );
        glob.maps.push(MapDef {
            kind: MapKind::Hash,
            key_size: 4,
            value_size: 8,
            max_entries: NUM_INTERNALS,
            flags: 0,
        });

        // Perf-event map for message transport; sized by the loader.
        glob.maps.push(MapDef {
            kind: MapKind::PerfEventArray,
            key_size: 4,
            value_size: 4,
            max_entries: NUM_CPUS_PLACEHOLDER,
            flags: 0,
        });

        glob
    }

    /// Plan storage for the declared globals, in declaration order.
    ///
    /// Map ids are handed out first-seen, which is an observable part of the
    /// emitted object's map layout; re-running over the same declaration
    /// list yields identical ids.
    pub fn plan(decls: &[GlobalVar]) -> Self {
        let mut glob = Globals::new();
        let mut long_map: Option<usize> = None;
        let mut str_map: Option<usize> = None;

        for v in decls {
            let slot = if v.index_types.is_empty() {
                match v.value_type {
                    ValueType::Long => {
                        let m = *long_map.get_or_insert_with(|| {
                            glob.push_map(MapDef {
                                kind: MapKind::Array,
                                key_size: 4,
                                value_size: 8,
                                max_entries: 0,
                                flags: 0,
                            })
                        });
                        let idx = glob.maps[m].max_entries;
                        glob.maps[m].max_entries += 1;
                        MapSlot::new(m as i64, idx as i64)
                    }
                    ValueType::Str => {
                        let m = *str_map.get_or_insert_with(|| {
                            glob.push_map(MapDef {
                                kind: MapKind::Array,
                                key_size: 4,
                                value_size: BPF_MAXSTRINGLEN,
                                max_entries: 0,
                                flags: 0,
                            })
                        });
                        let idx = glob.maps[m].max_entries;
                        glob.maps[m].max_entries += 1;
                        MapSlot::new(m as i64, idx as i64)
                    }
                    ValueType::Stats => {
                        if glob.scalar_stats.is_empty() {
                            for &f in STAT_FIELDS {
                                let m = glob.push_map(MapDef {
                                    kind: MapKind::PercpuArray,
                                    key_size: 4,
                                    value_size: 8,
                                    max_entries: 0,
                                    flags: 0,
                                });
                                glob.scalar_stats.insert(f, m);
                            }
                        }

                        // One element per aggregate in each field's array;
                        // the same index is used for every field.
                        let mut idx = None;
                        for &f in STAT_FIELDS {
                            let m = glob.scalar_stats[f];
                            let check = glob.maps[m].max_entries;
                            glob.maps[m].max_entries += 1;
                            match idx {
                                None => idx = Some(check),
                                Some(i) => debug_assert_eq!(i, check),
                            }
                        }
                        MapSlot::new(-1, idx.unwrap_or(0) as i64)
                    }
                }
            } else {
                glob.arrays
                    .insert(v.name.clone(), (v.index_types.clone(), v.value_type));
                let key_size: u32 = v
                    .index_types
                    .iter()
                    .map(|it| match it {
                        IndexType::Long => 8,
                        IndexType::Str => BPF_MAXSTRINGLEN,
                    })
                    .sum();
                let max_entries = if v.maxsize > 0 {
                    v.maxsize
                } else {
                    BPF_MAXMAPENTRIES
                };

                match v.value_type {
                    ValueType::Stats => {
                        let mut sm = StatsMap::new();
                        for &f in STAT_FIELDS {
                            let m = glob.push_map(MapDef {
                                kind: MapKind::PercpuHash,
                                key_size,
                                value_size: 8,
                                max_entries,
                                flags: 0,
                            });
                            sm.insert(f, m);
                        }
                        let agg_id = 1 + glob.aggregates.len() as u64;
                        glob.aggregates.insert(v.name.clone(), agg_id);
                        glob.array_stats.push((v.name.clone(), sm));
                        MapSlot::new(-1, -1)
                    }
                    elem => {
                        let value_size = match elem {
                            ValueType::Long => 8,
                            ValueType::Str => BPF_MAXSTRINGLEN,
                            ValueType::Stats => unreachable!(),
                        };
                        let m = glob.push_map(MapDef {
                            kind: MapKind::Hash,
                            key_size,
                            value_size,
                            max_entries,
                            flags: 0,
                        });
                        MapSlot::new(m as i64, -1)
                    }
                }
            };

            debug_assert_ne!(slot.map_id, INTERNAL_MAP_IDX as i64);
            let prev = glob.slots.insert(v.name.clone(), slot);
            debug_assert!(prev.is_none(), "duplicate global {}", v.name);
        }

        glob
    }

    fn push_map(&mut self, def: MapDef) -> usize {
        let id = self.maps.len();
        self.maps.push(def);
        id
    }

    pub fn slot(&self, name: &str) -> Option<MapSlot> {
        self.slots.get(name).copied()
    }

    /// Aggregate id of an array aggregate; 0 is the shared scalar set.
    pub fn aggregate_id(&self, name: &str) -> Option<u64> {
        self.aggregates.get(name).copied()
    }

    /// Declared index layout and element type of an array global.
    pub fn array_layout(&self, name: &str) -> Option<(&[IndexType], ValueType)> {
        self.arrays.get(name).map(|(it, vt)| (it.as_slice(), *vt))
    }

    /// Per-field map set of an array aggregate.
    pub fn array_stats_of(&self, name: &str) -> Option<&StatsMap> {
        self.array_stats
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, sm)| sm)
    }

    /// True when no user maps were allocated beyond the internal pair.
    pub fn is_empty(&self) -> bool {
        self.maps.len() <= PERF_EVENT_MAP_IDX + 1 && self.interned_strings.is_empty()
    }

    /// Intern a transport string, pooling by content.
    pub fn intern_string(&mut self, s: &str) -> usize {
        if let Some(&idx) = self.interned_str_map.get(s) {
            return idx;
        }
        let idx = self.interned_strings.len();
        self.interned_strings.push(s.to_string());
        self.interned_str_map.insert(s.to_string(), idx);
        idx
    }

    /// Record one foreach loop's layout, returning its loop id.
    pub fn intern_foreach_info(&mut self, fi: ForeachInfo) -> usize {
        let idx = self.foreach_loop_info.len();
        self.foreach_loop_info.push(fi);
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::GlobalVar;
    use crate::core::SourceLoc;

    fn scalar(name: &str, ty: ValueType) -> GlobalVar {
        GlobalVar {
            name: name.to_string(),
            value_type: ty,
            index_types: Vec::new(),
            maxsize: 0,
            init: None,
            loc: SourceLoc::default(),
        }
    }

    fn array(name: &str, ty: ValueType, idx: Vec<IndexType>, maxsize: u32) -> GlobalVar {
        GlobalVar {
            name: name.to_string(),
            value_type: ty,
            index_types: idx,
            maxsize,
            init: None,
            loc: SourceLoc::default(),
        }
    }

    #[test]
    fn test_internal_maps_come_first() {
        let glob = Globals::new();
        assert_eq!(glob.maps.len(), 2);
        assert_eq!(glob.maps[INTERNAL_MAP_IDX].kind, MapKind::Hash);
        assert_eq!(glob.maps[INTERNAL_MAP_IDX].max_entries, NUM_INTERNALS);
        assert_eq!(glob.maps[PERF_EVENT_MAP_IDX].kind, MapKind::PerfEventArray);
        assert_eq!(glob.slot("__STAPBPF_exit"), Some(MapSlot::new(0, EXIT_SLOT)));
        assert_eq!(
            glob.slot("__STAPBPF_errors"),
            Some(MapSlot::new(0, ERRORS_SLOT))
        );
        assert!(glob.is_empty());
    }

    #[test]
    fn test_scalars_share_typed_maps() {
        let decls = vec![
            scalar("a", ValueType::Long),
            scalar("s", ValueType::Str),
            scalar("b", ValueType::Long),
        ];
        let glob = Globals::plan(&decls);

        let a = glob.slot("a").unwrap();
        let b = glob.slot("b").unwrap();
        let s = glob.slot("s").unwrap();
        assert_eq!(a.map_id, b.map_id);
        assert_ne!(a.map_id, s.map_id);
        assert_eq!(a.idx, 0);
        assert_eq!(b.idx, 1);
        assert_eq!(glob.maps[a.map_id as usize].max_entries, 2);
        assert_eq!(glob.maps[s.map_id as usize].value_size, BPF_MAXSTRINGLEN);
    }

    #[test]
    fn test_array_key_layout() {
        let decls = vec![array(
            "t",
            ValueType::Long,
            vec![IndexType::Str, IndexType::Long],
            0,
        )];
        let glob = Globals::plan(&decls);

        let t = glob.slot("t").unwrap();
        assert!(t.is_array());
        assert!(!t.is_stat());
        let def = &glob.maps[t.map_id as usize];
        assert_eq!(def.kind, MapKind::Hash);
        assert_eq!(def.key_size, BPF_MAXSTRINGLEN + 8);
        assert_eq!(def.value_size, 8);
        assert_eq!(def.max_entries, BPF_MAXMAPENTRIES);

        let (layout, elem) = glob.array_layout("t").unwrap();
        assert_eq!(layout, &[IndexType::Str, IndexType::Long]);
        assert_eq!(elem, ValueType::Long);
    }

    #[test]
    fn test_scalar_aggregates_share_slot_index() {
        let decls = vec![
            scalar("x", ValueType::Stats),
            scalar("y", ValueType::Stats),
        ];
        let glob = Globals::plan(&decls);

        let x = glob.slot("x").unwrap();
        let y = glob.slot("y").unwrap();
        assert!(x.is_stat() && y.is_stat());
        assert_eq!(x.idx, 0);
        assert_eq!(y.idx, 1);
        assert_eq!(glob.scalar_stats.len(), STAT_FIELDS.len());
        for &f in STAT_FIELDS {
            assert_eq!(glob.maps[glob.scalar_stats[f]].max_entries, 2);
            assert_eq!(glob.maps[glob.scalar_stats[f]].kind, MapKind::PercpuArray);
        }
    }

    #[test]
    fn test_array_aggregates_get_ids_from_one() {
        let decls = vec![
            array("h", ValueType::Stats, vec![IndexType::Long], 100),
            array("g", ValueType::Stats, vec![IndexType::Long], 0),
        ];
        let glob = Globals::plan(&decls);

        assert_eq!(glob.aggregate_id("h"), Some(1));
        assert_eq!(glob.aggregate_id("g"), Some(2));
        let h = glob.array_stats_of("h").unwrap();
        for &f in STAT_FIELDS {
            assert_eq!(glob.maps[h[f]].kind, MapKind::PercpuHash);
            assert_eq!(glob.maps[h[f]].max_entries, 100);
        }
        assert_eq!(glob.slot("h"), Some(MapSlot::new(-1, -1)));
    }

    #[test]
    fn test_planner_idempotence() {
        let decls = vec![
            scalar("a", ValueType::Long),
            array("t", ValueType::Str, vec![IndexType::Long], 0),
            scalar("x", ValueType::Stats),
        ];
        let g1 = Globals::plan(&decls);
        let g2 = Globals::plan(&decls);

        assert_eq!(g1.maps, g2.maps);
        assert_eq!(g1.slot("a"), g2.slot("a"));
        assert_eq!(g1.slot("t"), g2.slot("t"));
        assert_eq!(g1.slot("x"), g2.slot("x"));
    }

    #[test]
    fn test_stats_map_intern_round_trip() {
        let mut sm = StatsMap::new();
        sm.insert("count", 5);
        sm.insert("sum", 6);

        let ism = intern_stats_map(&sm);
        assert_eq!(ism, vec![5, 6]);
        assert_eq!(deintern_stats_map(&ism), sm);
    }

    #[test]
    fn test_foreach_info_round_trip() {
        let fi = ForeachInfo {
            sort_direction: -1,
            sort_column: 2,
            keysize: 72,
            sort_column_size: 8,
            sort_column_ofs: 64,
        };
        assert_eq!(deintern_foreach_info(&intern_foreach_info(&fi)), fi);
    }

    #[test]
    fn test_string_interning() {
        let mut glob = Globals::new();
        let a = glob.intern_string("%d\n");
        let b = glob.intern_string("%s\n");
        let c = glob.intern_string("%d\n");
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(a, c);
        assert!(!glob.is_empty());
    }
}
