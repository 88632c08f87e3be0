//! End-to-end translation scenarios: lower a script construct, reparse the
//! emitted object, and check the instruction stream and metadata it produced.

use bumpalo::Bump;
use object::{Object as _, ObjectSection as _};

use bpfgen::ast::{
    AssignOp, BinaryOp, DeleteTarget, Expr, ExprKind, GlobalVar, IndexType, PrintSpec, Probe,
    ProbeKind, Script, ScriptFunction, SourceLoc, Stmt, ValueType,
};
use bpfgen::core::{TranslateError, TranslationSession};
use bpfgen::translate_script;

/// Split a code section back into (code, dst, src, off, imm) records.
fn decode(bytes: &[u8]) -> Vec<(u8, u8, u8, i16, i32)> {
    assert_eq!(bytes.len() % 8, 0);
    bytes
        .chunks(8)
        .map(|c| {
            (
                c[0],
                c[1] & 0x0f,
                c[1] >> 4,
                i16::from_le_bytes([c[2], c[3]]),
                i32::from_le_bytes([c[4], c[5], c[6], c[7]]),
            )
        })
        .collect()
}

fn section_insns(bytes: &[u8], name: &str) -> Vec<(u8, u8, u8, i16, i32)> {
    let file = object::read::File::parse(bytes).unwrap();
    let sec = file.section_by_name(name).unwrap();
    decode(sec.data().unwrap())
}

fn begin_probe(body: Stmt) -> Probe {
    Probe {
        kind: ProbeKind::Begin,
        body,
        loc: SourceLoc::default(),
    }
}

fn long_array(name: &str) -> GlobalVar {
    GlobalVar {
        name: name.to_string(),
        value_type: ValueType::Long,
        index_types: vec![IndexType::Long],
        maxsize: 0,
        init: None,
        loc: SourceLoc::default(),
    }
}

#[test]
fn print_sends_transport_sequence() {
    let arena = Bump::new();
    let session = TranslationSession::new(&arena);
    let body = Stmt::Expr(Expr::new(
        ExprKind::Print(PrintSpec {
            to_stream: true,
            format: None,
            args: vec![Expr::number(42)],
        }),
        ValueType::Long,
        SourceLoc::default(),
    ));
    let script = Script {
        probes: vec![begin_probe(body)],
        ..Script::default()
    };

    let bytes = translate_script(&session, &script).unwrap();

    // The synthesized default format for one long argument.
    let file = object::read::File::parse(&*bytes).unwrap();
    let strings = file.section_by_name("stapbpf_interned_strings").unwrap();
    assert_eq!(strings.data().unwrap(), b"\0%ld\0");

    // START, FORMAT, one ARG, END: four perf_event_output sends.
    let insns = section_insns(&bytes, "stap_begin");
    let sends = insns
        .iter()
        .filter(|i| i.0 == 0x85 && i.4 == 25)
        .count();
    assert_eq!(sends, 4);
}

#[test]
fn foreach_limit_records_loop_descriptor() {
    let arena = Bump::new();
    let session = TranslationSession::new(&arena);
    let body = Stmt::Foreach {
        indexes: vec!["k".to_string()],
        array: "t".to_string(),
        value: None,
        sort_direction: 0,
        sort_column: 0,
        limit: Some(Expr::number(2)),
        body: Box::new(Stmt::Null),
        loc: SourceLoc::default(),
    };
    let script = Script {
        globals: vec![long_array("t")],
        probes: vec![begin_probe(body)],
        ..Script::default()
    };

    let bytes = translate_script(&session, &script).unwrap();

    let file = object::read::File::parse(&*bytes).unwrap();
    let info = file.section_by_name("stapbpf_foreach_loop_info").unwrap();
    let words: Vec<u64> = info
        .data()
        .unwrap()
        .chunks(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    // One unsorted loop over a single 8-byte long key.
    assert_eq!(words, vec![0, 0, 8, 0, (-1i64) as u64]);

    // The first-key fetch and the per-iteration advance both go through the
    // key-iteration pseudo helper.
    let insns = section_insns(&bytes, "stap_begin");
    let fetches = insns
        .iter()
        .filter(|i| i.0 == 0x85 && i.4 == -1)
        .count();
    assert_eq!(fetches, 2);
}

#[test]
fn bit_test_condition_uses_jset() {
    let arena = Bump::new();
    let session = TranslationSession::new(&arena);
    let cond = Expr::new(
        ExprKind::Binary {
            op: BinaryOp::BitAnd,
            left: Box::new(Expr::symbol("flags", ValueType::Long)),
            right: Box::new(Expr::number(4)),
        },
        ValueType::Long,
        SourceLoc::default(),
    );
    let body = Stmt::If {
        cond,
        then_stmt: Box::new(Stmt::Null),
        else_stmt: None,
        loc: SourceLoc::default(),
    };
    let script = Script {
        globals: vec![GlobalVar {
            name: "flags".to_string(),
            value_type: ValueType::Long,
            index_types: Vec::new(),
            maxsize: 0,
            init: None,
            loc: SourceLoc::default(),
        }],
        probes: vec![begin_probe(body)],
        ..Script::default()
    };

    let bytes = translate_script(&session, &script).unwrap();
    let insns = section_insns(&bytes, "stap_begin");
    // The mask is an immediate, so the K form; no fallback != 0 compare.
    let jsets = insns
        .iter()
        .filter(|i| i.0 == 0x45 || i.0 == 0x4d)
        .count();
    assert_eq!(jsets, 1);
}

#[test]
fn raise_in_try_body_reaches_catch() {
    let arena = Bump::new();
    let session = TranslationSession::new(&arena);
    let raise = ScriptFunction {
        name: "fail".to_string(),
        formal_args: Vec::new(),
        body: Stmt::Embedded {
            code: "jump_to_catch \"boom\";".to_string(),
            loc: SourceLoc::default(),
        },
        loc: SourceLoc::default(),
    };
    let body = Stmt::TryCatch {
        body: Box::new(Stmt::Expr(Expr::new(
            ExprKind::FunctionCall {
                name: "fail".to_string(),
                args: Vec::new(),
            },
            ValueType::Long,
            SourceLoc::default(),
        ))),
        catch_var: Some("msg".to_string()),
        handler: Box::new(Stmt::Null),
        loc: SourceLoc::default(),
    };
    let script = Script {
        functions: vec![raise],
        probes: vec![begin_probe(body)],
        ..Script::default()
    };

    let bytes = translate_script(&session, &script).unwrap();
    let insns = section_insns(&bytes, "stap_begin");
    assert!(!insns.is_empty());
    // The raised message string was interned for the catch binding.
    let file = object::read::File::parse(&*bytes).unwrap();
    assert!(file.section_by_name("stapbpf_interned_strings").is_some());
}

#[test]
fn embedded_call_inlines_script_function() {
    let arena = Bump::new();
    let session = TranslationSession::new(&arena);
    let bump = ScriptFunction {
        name: "bump".to_string(),
        formal_args: Vec::new(),
        body: Stmt::Expr(Expr::new(
            ExprKind::Assign {
                op: AssignOp::Assign,
                lvalue: Box::new(Expr::symbol("hits", ValueType::Long)),
                rvalue: Box::new(Expr::number(1)),
            },
            ValueType::Long,
            SourceLoc::default(),
        )),
        loc: SourceLoc::default(),
    };
    let body = Stmt::Embedded {
        code: "call -, bump;".to_string(),
        loc: SourceLoc::default(),
    };
    let script = Script {
        globals: vec![GlobalVar {
            name: "hits".to_string(),
            value_type: ValueType::Long,
            index_types: Vec::new(),
            maxsize: 0,
            init: None,
            loc: SourceLoc::default(),
        }],
        functions: vec![bump],
        probes: vec![begin_probe(body)],
        ..Script::default()
    };

    let bytes = translate_script(&session, &script).unwrap();

    // The callee's global store was inlined: the probe body updates the
    // scalar map even though the script statement was only a call directive.
    // The shared exit path's error accounting contributes the other update.
    let insns = section_insns(&bytes, "stap_begin");
    let updates = insns.iter().filter(|i| i.0 == 0x85 && i.4 == 2).count();
    assert_eq!(updates, 2);
}

#[test]
fn embedded_call_to_recursive_function_is_rejected() {
    let arena = Bump::new();
    let session = TranslationSession::new(&arena);
    let spin = ScriptFunction {
        name: "spin".to_string(),
        formal_args: Vec::new(),
        body: Stmt::Embedded {
            code: "call -, spin;".to_string(),
            loc: SourceLoc::default(),
        },
        loc: SourceLoc::default(),
    };
    let body = Stmt::Embedded {
        code: "call -, spin;".to_string(),
        loc: SourceLoc::default(),
    };
    let script = Script {
        functions: vec![spin],
        probes: vec![begin_probe(body)],
        ..Script::default()
    };

    let err = translate_script(&session, &script).unwrap_err();
    assert!(matches!(err, TranslateError::Recursion { name, .. } if name == "spin"));
}

#[test]
fn delete_scalar_string_resets_slot() {
    let arena = Bump::new();
    let session = TranslationSession::new(&arena);
    let body = Stmt::Delete {
        target: DeleteTarget::Symbol("tag".to_string()),
        loc: SourceLoc::default(),
    };
    let script = Script {
        globals: vec![GlobalVar {
            name: "tag".to_string(),
            value_type: ValueType::Str,
            index_types: Vec::new(),
            maxsize: 0,
            init: None,
            loc: SourceLoc::default(),
        }],
        probes: vec![begin_probe(body)],
        ..Script::default()
    };

    let bytes = translate_script(&session, &script).unwrap();

    // The whole string-sized value is zeroed on the frame before the update,
    // so the slot becomes the empty string rather than an error.
    let insns = section_insns(&bytes, "stap_begin");
    let zero_stores = insns
        .iter()
        .filter(|i| i.0 == 0x7a && i.4 == 0)
        .count();
    assert!(zero_stores >= 8);
    // One update writes the zeroed value back, one belongs to the shared
    // exit path's error accounting.
    let updates = insns.iter().filter(|i| i.0 == 0x85 && i.4 == 2).count();
    assert_eq!(updates, 2);
}

#[test]
fn kernel_target_rejects_loops() {
    let arena = Bump::new();
    let session = TranslationSession::new(&arena);
    let body = Stmt::Foreach {
        indexes: vec!["k".to_string()],
        array: "t".to_string(),
        value: None,
        sort_direction: 0,
        sort_column: 0,
        limit: None,
        body: Box::new(Stmt::Null),
        loc: SourceLoc::new("t.stp", 7, 3),
    };
    let script = Script {
        globals: vec![long_array("t")],
        probes: vec![Probe {
            kind: ProbeKind::Kprobe {
                symbol: "do_sys_open".to_string(),
            },
            body,
            loc: SourceLoc::new("t.stp", 7, 3),
        }],
        ..Script::default()
    };

    let err = translate_script(&session, &script).unwrap_err();
    assert!(matches!(err, TranslateError::Unsupported { construct, .. } if construct == "loop"));
}
