// The driver turns one checked script into one relocatable object. Storage is
// planned first so every program sees the same map layout. The userspace-variant
// groups come first in the file: all begin probes share one stap_begin program
// (with global initializers prepended), end probes share stap_end, error probes
// stap_error. Each kernel-variant probe then gets its own program under its
// probe-point-derived section name. A unit that fails to translate is reported
// with its source location and the pass keeps going, so one broken probe does not
// hide diagnostics in the others; the object is only built and written when every
// unit lowered cleanly.

//! Whole-script translation driver.

use hashbrown::HashMap;

use crate::ast::{
    AssignOp, Expr, ExprKind, GlobalVar, Literal, ProbeKind, Script, ScriptFunction, Stmt,
    ValueType,
};
use crate::core::{TranslateError, TranslateResult, TranslationSession};
use crate::emit::{map_symbol_names, ObjectEmitter};
use crate::globals::Globals;
use crate::ir::{Program, Target};
use crate::lower::{lower_kernel_probe, lower_user_group};

/// Assignment statements seeding declared scalar initializers, run before the
/// first begin body.
fn init_stmts(globals: &[GlobalVar]) -> Vec<Stmt> {
    let mut out = Vec::new();
    for v in globals {
        let init = match &v.init {
            Some(i) => i,
            None => continue,
        };
        let rvalue = match init {
            Literal::Number(n) => Expr::new(ExprKind::Number(*n), ValueType::Long, v.loc.clone()),
            Literal::Str(s) => Expr::new(ExprKind::Str(s.clone()), ValueType::Str, v.loc.clone()),
        };
        let lvalue = Expr::new(ExprKind::Symbol(v.name.clone()), v.value_type, v.loc.clone());
        out.push(Stmt::Expr(Expr::new(
            ExprKind::Assign {
                op: AssignOp::Assign,
                lvalue: Box::new(lvalue),
                rvalue: Box::new(rvalue),
            },
            v.value_type,
            v.loc.clone(),
        )));
    }
    out
}

/// Translate a whole script into relocatable object bytes.
///
/// Pass options (script name, soft-error ceiling, kernel version code) come
/// from the session's configuration.
pub fn translate_script<'s, 'a>(
    session: &'s TranslationSession<'a>,
    script: &Script,
) -> TranslateResult<Vec<u8>> {
    let mut glob = Globals::plan(&script.globals);
    let mut functions: HashMap<String, ScriptFunction> = HashMap::new();
    for f in &script.functions {
        // Overloads are resolved by the front-end; a second candidate for
        // the same name is an input defect.
        if functions.insert(f.name.clone(), f.clone()).is_some() {
            return Err(TranslateError::UnresolvedCall {
                name: f.name.clone(),
                candidates: 2,
                loc: f.loc.clone(),
            });
        }
    }

    let mut begin: Vec<&Stmt> = Vec::new();
    let mut end: Vec<&Stmt> = Vec::new();
    let mut error: Vec<&Stmt> = Vec::new();
    let mut kernel = Vec::new();
    for p in &script.probes {
        match p.kind {
            ProbeKind::Begin => begin.push(&p.body),
            ProbeKind::End => end.push(&p.body),
            ProbeKind::Error => error.push(&p.body),
            _ => kernel.push(p),
        }
    }

    let init = init_stmts(&script.globals);
    let mut programs: Vec<(String, Program<'s, 'a>)> = Vec::new();
    let mut first_err: Option<TranslateError> = None;

    let emit_user_group = |name: &str,
                           init: &[Stmt],
                           bodies: &[&Stmt],
                           glob: &mut Globals,
                           programs: &mut Vec<(String, Program<'s, 'a>)>,
                           first_err: &mut Option<TranslateError>| {
        if init.is_empty() && bodies.is_empty() {
            return;
        }
        let mut prog = Program::new(session, Target::UserBpfInterp);
        match lower_user_group(&mut prog, glob, &functions, init, bodies) {
            Ok(()) => {
                session.record_program(name, prog.num_blocks(), prog.num_insns());
                programs.push((name.to_string(), prog));
            }
            Err(e) => {
                log::error!("{name}: {e}");
                first_err.get_or_insert(e);
            }
        }
    };

    emit_user_group("stap_begin", &init, &begin, &mut glob, &mut programs, &mut first_err);
    emit_user_group("stap_end", &[], &end, &mut glob, &mut programs, &mut first_err);
    emit_user_group("stap_error", &[], &error, &mut glob, &mut programs, &mut first_err);

    for p in kernel {
        let name = p.kind.section_name();
        let mut prog = Program::new(session, Target::KernelBpf);
        match lower_kernel_probe(&mut prog, &mut glob, &functions, &p.body) {
            Ok(()) => {
                session.record_program(&name, prog.num_blocks(), prog.num_insns());
                programs.push((name, prog));
            }
            Err(e) => {
                log::error!("{}: {name}: {e}", p.loc);
                first_err.get_or_insert(e);
            }
        }
    }

    if let Some(e) = first_err {
        log::warn!("translation failed; discarding partial object");
        return Err(e);
    }

    let names = map_symbol_names(&glob, &script.globals);
    let mut emitter = ObjectEmitter::new(&mut glob);
    emitter.add_maps(&names)?;
    for (name, prog) in programs.iter_mut() {
        emitter.add_program(prog, name)?;
    }
    let bytes = emitter.finish(session.config())?;
    log::info!(
        "translated {}: {}",
        session.config().script_name,
        session.stats()
    );
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{PrintSpec, Probe, SourceLoc};
    use bumpalo::Bump;
    use object::{Object as _, ObjectSection as _};

    fn print_42() -> Stmt {
        Stmt::Expr(Expr::new(
            ExprKind::Print(PrintSpec {
                to_stream: true,
                format: None,
                args: vec![Expr::number(42)],
            }),
            ValueType::Long,
            SourceLoc::default(),
        ))
    }

    fn section_names(bytes: &[u8]) -> Vec<String> {
        let file = object::read::File::parse(bytes).unwrap();
        file.sections()
            .filter_map(|s| s.name().ok().map(str::to_string))
            .collect()
    }

    #[test]
    fn test_begin_probe_produces_object() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        let script = Script {
            probes: vec![Probe {
                kind: ProbeKind::Begin,
                body: print_42(),
                loc: SourceLoc::default(),
            }],
            ..Script::default()
        };

        let bytes = translate_script(&session, &script).unwrap();
        let names = section_names(&bytes);
        assert!(names.contains(&"maps".to_string()));
        assert!(names.contains(&"stap_begin".to_string()));
        assert!(!names.contains(&"stap_end".to_string()));
        assert_eq!(session.stats().programs_translated, 1);
    }

    #[test]
    fn test_init_only_script_still_emits_begin() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        let script = Script {
            globals: vec![GlobalVar {
                name: "threshold".to_string(),
                value_type: ValueType::Long,
                index_types: Vec::new(),
                maxsize: 0,
                init: Some(Literal::Number(100)),
                loc: SourceLoc::default(),
            }],
            ..Script::default()
        };

        let bytes = translate_script(&session, &script).unwrap();
        assert!(section_names(&bytes).contains(&"stap_begin".to_string()));
    }

    #[test]
    fn test_duplicate_function_candidates_rejected() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        let f = ScriptFunction {
            name: "twice".to_string(),
            formal_args: Vec::new(),
            body: Stmt::Null,
            loc: SourceLoc::default(),
        };
        let script = Script {
            functions: vec![f.clone(), f],
            probes: vec![Probe {
                kind: ProbeKind::Begin,
                body: print_42(),
                loc: SourceLoc::default(),
            }],
            ..Script::default()
        };

        let err = translate_script(&session, &script).unwrap_err();
        assert!(matches!(err, TranslateError::UnresolvedCall { candidates: 2, .. }));
    }

    #[test]
    fn test_kernel_loop_fails_but_other_units_translate() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        let bad = Stmt::For {
            init: None,
            cond: None,
            update: None,
            body: Box::new(Stmt::Null),
            loc: SourceLoc::new("t.stp", 3, 1),
        };
        let script = Script {
            probes: vec![
                Probe {
                    kind: ProbeKind::Kprobe {
                        symbol: "do_sys_open".to_string(),
                    },
                    body: bad,
                    loc: SourceLoc::new("t.stp", 3, 1),
                },
                Probe {
                    kind: ProbeKind::Begin,
                    body: print_42(),
                    loc: SourceLoc::default(),
                },
            ],
            ..Script::default()
        };

        let err = translate_script(&session, &script).unwrap_err();
        assert!(matches!(err, TranslateError::Unsupported { .. }));
        // The independent begin unit still lowered before the pass gave up.
        assert_eq!(session.stats().programs_translated, 1);
    }
}
