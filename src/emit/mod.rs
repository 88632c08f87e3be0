// Object construction sits on the object crate's ELF writer. One ObjectEmitter
// accumulates the whole output file: the "maps" section with one 20-byte map_def
// record and one local data symbol per map, a code section per translated program
// (with map-fd relocations against the map symbols), and the metadata sections the
// userspace loader reads back: kernel version, license, script name, the interned
// transport strings, the aggregate id/map-id table, and the foreach loop
// descriptors. Sections with no content are omitted. Symbol, string and section
// header tables come from the object crate.

//! Relocatable ELF object construction.

use object::write::{Object, Relocation, SectionId, Symbol, SymbolId, SymbolSection};
use object::{
    elf, Architecture, BinaryFormat, Endianness, RelocationFlags, SectionFlags, SectionKind,
    SymbolFlags, SymbolKind, SymbolScope,
};

use crate::ast::GlobalVar;
use crate::core::{SessionConfig, TranslateError, TranslateResult};
use crate::globals::{intern_foreach_info, intern_stats_map, Globals, STAT_FIELDS};
use crate::ir::{Program, Target};

mod encode;

pub use encode::{encode_program, EncodedProgram, MapReloc, BPF_INSN_SIZE};

/// ELF relocation type resolving a map symbol to its file descriptor.
pub const R_BPF_MAP_FD: u32 = 1;

/// Size of one serialized map_def record in the "maps" section.
pub const MAP_DEF_SIZE: u64 = 20;

/// Builder for the output object file.
pub struct ObjectEmitter<'g> {
    obj: Object<'static>,
    glob: &'g mut Globals,
    map_syms: Vec<SymbolId>,
}

impl<'g> ObjectEmitter<'g> {
    pub fn new(glob: &'g mut Globals) -> Self {
        Self {
            obj: Object::new(BinaryFormat::Elf, Architecture::Bpf, Endianness::Little),
            glob,
            map_syms: Vec::new(),
        }
    }

    /// Emit the "maps" section and its per-map symbols. `names` supplies one
    /// symbol name per planned map, in map-id order.
    pub fn add_maps(&mut self, names: &[String]) -> TranslateResult<()> {
        debug_assert_eq!(names.len(), self.glob.maps.len());

        let mut data = Vec::with_capacity(self.glob.maps.len() * MAP_DEF_SIZE as usize);
        for def in &self.glob.maps {
            for word in [
                def.kind as u32,
                def.key_size,
                def.value_size,
                def.max_entries,
                def.flags,
            ] {
                data.extend_from_slice(&word.to_le_bytes());
            }
        }

        let sid = self
            .obj
            .add_section(Vec::new(), b"maps".to_vec(), SectionKind::Data);
        self.obj.append_section_data(sid, &data, 4);

        for (m, name) in names.iter().enumerate() {
            let sym = self.obj.add_symbol(Symbol {
                name: name.clone().into_bytes(),
                value: m as u64 * MAP_DEF_SIZE,
                size: MAP_DEF_SIZE,
                kind: SymbolKind::Data,
                scope: SymbolScope::Compilation,
                weak: false,
                section: SymbolSection::Section(sid),
                flags: SymbolFlags::None,
            });
            self.map_syms.push(sym);
        }
        log::debug!("maps section: {} definitions", self.glob.maps.len());
        Ok(())
    }

    /// Encode one translated program into its own code section, registering a
    /// map-fd relocation for every map-reference load.
    pub fn add_program(&mut self, prog: &mut Program<'_, '_>, name: &str) -> TranslateResult<()> {
        let enc = encode_program(prog, self.glob)?;

        let sid = self
            .obj
            .add_section(Vec::new(), name.as_bytes().to_vec(), SectionKind::Text);
        self.obj.append_section_data(sid, &enc.bytes, 8);
        if prog.target() != Target::KernelBpf {
            // Userspace programs are interpreted straight from the file and
            // never mapped; drop the alloc flag the Text kind implies.
            self.obj.section_mut(sid).flags = SectionFlags::Elf {
                sh_flags: u64::from(elf::SHF_EXECINSTR),
            };
        }

        for r in &enc.relocs {
            let symbol = *self.map_syms.get(r.map_id).ok_or_else(|| {
                TranslateError::CodeGen {
                    reason: format!("relocation against unplanned map {}", r.map_id),
                }
            })?;
            self.obj.add_relocation(
                sid,
                Relocation {
                    offset: u64::from(r.slot) * BPF_INSN_SIZE as u64,
                    symbol,
                    addend: 0,
                    flags: RelocationFlags::Elf { r_type: R_BPF_MAP_FD },
                },
            )?;
        }

        log::debug!(
            "section {name}: {} bytes, {} relocations",
            enc.bytes.len(),
            enc.relocs.len()
        );
        Ok(())
    }

    fn add_metadata(&mut self, name: &[u8], data: &[u8], align: u64) -> SectionId {
        let sid = self
            .obj
            .add_section(Vec::new(), name.to_vec(), SectionKind::ReadOnlyData);
        self.obj.append_section_data(sid, data, align);
        // Loader-only metadata, never mapped.
        self.obj.section_mut(sid).flags = SectionFlags::Elf { sh_flags: 0 };
        sid
    }

    /// Write the metadata sections and finish the object.
    pub fn finish(mut self, config: &SessionConfig) -> TranslateResult<Vec<u8>> {
        self.add_metadata(b"version", &config.kernel_version.to_le_bytes(), 4);
        self.add_metadata(b"license", b"GPL\0", 1);

        let mut name = config.script_name.clone().into_bytes();
        name.push(0);
        self.add_metadata(b"stapbpf_script_name", &name, 1);

        if !self.glob.interned_strings.is_empty() {
            // Leading NUL so index 0 is never a valid string start offset.
            let mut data = vec![0u8];
            for s in &self.glob.interned_strings {
                data.extend_from_slice(s.as_bytes());
                data.push(0);
            }
            self.add_metadata(b"stapbpf_interned_strings", &data, 1);
        }

        let mut rows: Vec<u8> = Vec::new();
        if !self.glob.scalar_stats.is_empty() {
            rows.extend_from_slice(&0u64.to_le_bytes());
            for id in intern_stats_map(&self.glob.scalar_stats) {
                rows.extend_from_slice(&id.to_le_bytes());
            }
        }
        for (name, sm) in &self.glob.array_stats {
            let agg = self
                .glob
                .aggregate_id(name)
                .ok_or_else(|| TranslateError::CodeGen {
                    reason: format!("aggregate {name} has no id"),
                })?;
            rows.extend_from_slice(&agg.to_le_bytes());
            for id in intern_stats_map(sm) {
                rows.extend_from_slice(&id.to_le_bytes());
            }
        }
        if !rows.is_empty() {
            self.add_metadata(b"stapbpf_aggregates", &rows, 8);
        }

        if !self.glob.foreach_loop_info.is_empty() {
            let mut data = Vec::new();
            for fi in &self.glob.foreach_loop_info {
                for word in intern_foreach_info(fi) {
                    data.extend_from_slice(&word.to_le_bytes());
                }
            }
            self.add_metadata(b"stapbpf_foreach_loop_info", &data, 8);
        }

        self.obj.write().map_err(Into::into)
    }
}

/// Symbol name of every planned map, in map-id order.
///
/// Non-aggregate globals name the map holding them (first declaration wins
/// for the shared scalar maps); aggregate field maps are named
/// `stat.<field>` for the shared scalar set and `<var>.stat.<field>` for
/// array aggregates. Maps no declaration reaches fall back to `map.<N>`.
pub fn map_symbol_names(glob: &Globals, decls: &[GlobalVar]) -> Vec<String> {
    let mut names: Vec<Option<String>> = vec![None; glob.maps.len()];
    for v in decls {
        let slot = match glob.slot(&v.name) {
            Some(s) => s,
            None => continue,
        };
        if slot.is_stat() {
            if slot.is_array() {
                if let Some(sm) = glob.array_stats_of(&v.name) {
                    for &f in STAT_FIELDS {
                        if let Some(&m) = sm.get(f) {
                            names[m].get_or_insert_with(|| format!("{}.stat.{f}", v.name));
                        }
                    }
                }
            } else {
                for &f in STAT_FIELDS {
                    if let Some(&m) = glob.scalar_stats.get(f) {
                        names[m].get_or_insert_with(|| format!("stat.{f}"));
                    }
                }
            }
        } else if slot.map_id >= 0 {
            names[slot.map_id as usize].get_or_insert_with(|| v.name.clone());
        }
    }
    names
        .into_iter()
        .enumerate()
        .map(|(i, n)| n.unwrap_or_else(|| format!("map.{i}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{IndexType, ValueType};
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

    #[test]
    fn test_map_symbol_naming() {
        let decls = vec![
            scalar("a", ValueType::Long),
            scalar("b", ValueType::Long),
            scalar("x", ValueType::Stats),
            GlobalVar {
                name: "hist".to_string(),
                value_type: ValueType::Stats,
                index_types: vec![IndexType::Long],
                maxsize: 0,
                init: None,
                loc: SourceLoc::default(),
            },
        ];
        let glob = Globals::plan(&decls);
        let names = map_symbol_names(&glob, &decls);

        assert_eq!(names.len(), glob.maps.len());
        // Internal maps have no declaration; they keep the fallback name.
        assert_eq!(names[0], "map.0");
        assert_eq!(names[1], "map.1");
        // The shared long map takes the first declaration's name.
        let a = glob.slot("a").unwrap();
        assert_eq!(names[a.map_id as usize], "a");
        for &f in STAT_FIELDS {
            assert_eq!(names[glob.scalar_stats[f]], format!("stat.{f}"));
            let hist = glob.array_stats_of("hist").unwrap();
            assert_eq!(names[hist[f]], format!("hist.stat.{f}"));
        }
    }

    #[test]
    fn test_empty_metadata_sections_omitted() {
        let mut glob = Globals::new();
        let emitter = ObjectEmitter::new(&mut glob);
        let bytes = emitter.finish(&SessionConfig::default()).unwrap();

        use object::{Object as _, ObjectSection as _};
        let file = object::read::File::parse(&*bytes).unwrap();
        let names: Vec<String> = file
            .sections()
            .filter_map(|s| s.name().ok().map(str::to_string))
            .collect();
        assert!(names.contains(&"license".to_string()));
        assert!(names.contains(&"stapbpf_script_name".to_string()));
        assert!(!names.contains(&"stapbpf_interned_strings".to_string()));
        assert!(!names.contains(&"stapbpf_aggregates".to_string()));
        assert!(!names.contains(&"stapbpf_foreach_loop_info".to_string()));
    }
}
