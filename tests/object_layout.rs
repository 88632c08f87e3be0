//! Object-layout integration tests: translate small scripts and reparse the
//! emitted bytes, checking section, symbol and relocation structure.

use bumpalo::Bump;
use object::{
    Object as _, ObjectSection as _, ObjectSymbol as _, RelocationFlags, RelocationTarget,
    SectionFlags,
};

use bpfgen::ast::{
    AssignOp, Expr, ExprKind, GlobalVar, IndexType, Probe, ProbeKind, Script, SourceLoc, Stmt,
    ValueType,
};
use bpfgen::core::{SessionConfig, TranslationSession};
use bpfgen::{translate_script, R_BPF_MAP_FD};

fn scalar_long(name: &str) -> GlobalVar {
    GlobalVar {
        name: name.to_string(),
        value_type: ValueType::Long,
        index_types: Vec::new(),
        maxsize: 0,
        init: None,
        loc: SourceLoc::default(),
    }
}

fn assign(name: &str, v: i64) -> Stmt {
    Stmt::Expr(Expr::new(
        ExprKind::Assign {
            op: AssignOp::Assign,
            lvalue: Box::new(Expr::symbol(name, ValueType::Long)),
            rvalue: Box::new(Expr::number(v)),
        },
        ValueType::Long,
        SourceLoc::default(),
    ))
}

#[test]
fn maps_section_and_symbols() {
    let arena = Bump::new();
    let session = TranslationSession::new(&arena);
    let script = Script {
        globals: vec![
            scalar_long("hits"),
            GlobalVar {
                name: "times".to_string(),
                value_type: ValueType::Stats,
                index_types: vec![IndexType::Long],
                maxsize: 128,
                init: None,
                loc: SourceLoc::default(),
            },
        ],
        probes: vec![Probe {
            kind: ProbeKind::Begin,
            body: assign("hits", 0),
            loc: SourceLoc::default(),
        }],
        ..Script::default()
    };

    let bytes = translate_script(&session, &script).unwrap();
    let file = object::read::File::parse(&*bytes).unwrap();

    let maps = file.section_by_name("maps").unwrap();
    let data = maps.data().unwrap();
    // 20 bytes per map: 2 internal, the shared long map, 2 per-field
    // aggregate maps.
    assert_eq!(data.len() % 20, 0);
    assert_eq!(data.len() / 20, 5);

    // Internal exit/errors map: HASH, key 4, value 8, 2 entries.
    let words: Vec<u32> = data[..20]
        .chunks(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert_eq!(words, vec![1, 4, 8, 2, 0]);

    let sym_names: Vec<&str> = file.symbols().filter_map(|s| s.name().ok()).collect();
    assert!(sym_names.contains(&"hits"));
    assert!(sym_names.contains(&"times.stat.count"));
    assert!(sym_names.contains(&"times.stat.sum"));
}

#[test]
fn kernel_probe_relocations_and_flags() {
    let arena = Bump::new();
    let session = TranslationSession::new(&arena);
    let script = Script {
        globals: vec![scalar_long("hits")],
        probes: vec![Probe {
            kind: ProbeKind::Kprobe {
                symbol: "do_sys_open".to_string(),
            },
            body: assign("hits", 1),
            loc: SourceLoc::default(),
        }],
        ..Script::default()
    };

    let bytes = translate_script(&session, &script).unwrap();
    let file = object::read::File::parse(&*bytes).unwrap();

    let code = file.section_by_name("kprobe/do_sys_open").unwrap();
    match code.flags() {
        SectionFlags::Elf { sh_flags } => {
            assert_ne!(sh_flags & u64::from(object::elf::SHF_EXECINSTR), 0);
            assert_ne!(sh_flags & u64::from(object::elf::SHF_ALLOC), 0);
        }
        other => panic!("unexpected flags {other:?}"),
    }

    let relocs: Vec<_> = code.relocations().collect();
    // Prologue map loads plus the store to the shared long map.
    assert!(relocs.len() >= 3);
    let mut saw_hits = false;
    for (off, r) in &relocs {
        assert_eq!(off % 8, 0);
        assert_eq!(
            r.flags(),
            RelocationFlags::Elf {
                r_type: R_BPF_MAP_FD
            }
        );
        if let RelocationTarget::Symbol(idx) = r.target() {
            if file.symbol_by_index(idx).unwrap().name() == Ok("hits") {
                saw_hits = true;
            }
        }
    }
    assert!(saw_hits);
}

#[test]
fn userspace_sections_are_not_alloc() {
    let arena = Bump::new();
    let session = TranslationSession::new(&arena);
    let script = Script {
        probes: vec![Probe {
            kind: ProbeKind::Begin,
            body: Stmt::Null,
            loc: SourceLoc::default(),
        }],
        ..Script::default()
    };

    let bytes = translate_script(&session, &script).unwrap();
    let file = object::read::File::parse(&*bytes).unwrap();
    let code = file.section_by_name("stap_begin").unwrap();
    match code.flags() {
        SectionFlags::Elf { sh_flags } => {
            assert_ne!(sh_flags & u64::from(object::elf::SHF_EXECINSTR), 0);
            assert_eq!(sh_flags & u64::from(object::elf::SHF_ALLOC), 0);
        }
        other => panic!("unexpected flags {other:?}"),
    }
}

#[test]
fn metadata_sections_round_trip() {
    let arena = Bump::new();
    let session = TranslationSession::with_config(
        &arena,
        SessionConfig {
            script_name: "trace_open".to_string(),
            max_errors: 5,
            kernel_version: (4 << 16) | (19 << 8),
        },
    );
    let script = Script {
        probes: vec![Probe {
            kind: ProbeKind::Begin,
            body: Stmt::Null,
            loc: SourceLoc::default(),
        }],
        ..Script::default()
    };

    let bytes = translate_script(&session, &script).unwrap();
    let file = object::read::File::parse(&*bytes).unwrap();

    let version = file.section_by_name("version").unwrap();
    assert_eq!(
        version.data().unwrap(),
        ((4u32 << 16) | (19 << 8)).to_le_bytes()
    );
    let license = file.section_by_name("license").unwrap();
    assert_eq!(license.data().unwrap(), b"GPL\0");
    let name = file.section_by_name("stapbpf_script_name").unwrap();
    assert_eq!(name.data().unwrap(), b"trace_open\0");

    // No printf, no foreach, no stats: those sections must be absent.
    assert!(file.section_by_name("stapbpf_interned_strings").is_none());
    assert!(file.section_by_name("stapbpf_aggregates").is_none());
    assert!(file.section_by_name("stapbpf_foreach_loop_info").is_none());
}

#[test]
fn scalar_aggregate_rows_in_aggregates_section() {
    let arena = Bump::new();
    let session = TranslationSession::new(&arena);
    let script = Script {
        globals: vec![GlobalVar {
            name: "lat".to_string(),
            value_type: ValueType::Stats,
            index_types: Vec::new(),
            maxsize: 0,
            init: None,
            loc: SourceLoc::default(),
        }],
        probes: vec![Probe {
            kind: ProbeKind::Begin,
            body: Stmt::Null,
            loc: SourceLoc::default(),
        }],
        ..Script::default()
    };

    let bytes = translate_script(&session, &script).unwrap();
    let file = object::read::File::parse(&*bytes).unwrap();
    let agg = file.section_by_name("stapbpf_aggregates").unwrap();
    let words: Vec<u64> = agg
        .data()
        .unwrap()
        .chunks(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    // One row: the shared scalar set, aggregate id 0, one map id per field.
    assert_eq!(words.len(), 3);
    assert_eq!(words[0], 0);
    assert!(words[1] >= 2 && words[2] >= 2);
    assert_ne!(words[1], words[2]);
}
