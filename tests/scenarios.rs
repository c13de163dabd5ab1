//! End-to-end pipeline tests: source text in, pure data tree out.

use oxdef_compiler::diagnostics::ErrorKind;
use oxdef_compiler::expression_tree::EvalValue;
use oxdef_compiler::object_tree::{recurse_nodes, BlockRc, Document, Literal, Value};
use oxdef_compiler::transaction::Transaction;
use oxdef_compiler::{Preprocessor, PreprocessorConfiguration};

fn preprocess(source: &str) -> Result<Document, oxdef_compiler::diagnostics::CompilerError> {
    let preprocessor = Preprocessor::new(PreprocessorConfiguration::new());
    let transaction = Transaction::new();
    spin_on::spin_on(preprocessor.preprocess_source(source.into(), None, &transaction))
}

fn prop(block: &BlockRc, name: &str) -> Value {
    block
        .borrow()
        .properties
        .get(name)
        .cloned()
        .unwrap_or_else(|| panic!("missing property '{name}'"))
}

fn number(n: f64) -> Value {
    Value::Literal(Literal::Number(n))
}

fn top_ids(doc: &Document) -> Vec<String> {
    doc.blocks().map(|b| b.borrow().id.as_deref().unwrap_or("?").to_string()).collect()
}

#[test]
fn arithmetic_via_set_and_property_expression() {
    let doc = preprocess("<set w = 200> [Box (width: (w + 40))]").unwrap();
    assert_eq!(top_ids(&doc), ["Box"]);
    let block = doc.blocks().next().unwrap().clone();
    assert_eq!(prop(&block, "width"), number(240.0));
}

#[test]
fn foreach_over_array_literal_variable() {
    let doc = preprocess(
        "<set items = {10, 20, 30}> \
         [List <foreach (x in items)> [Item (v: (x * 2))] </foreach> ]",
    )
    .unwrap();
    let list = doc.blocks().next().unwrap().clone();
    let children = list.borrow().child_blocks();
    assert_eq!(children.len(), 3);
    assert_eq!(prop(&children[0], "v"), number(20.0));
    assert_eq!(prop(&children[1], "v"), number(40.0));
    assert_eq!(prop(&children[2], "v"), number(60.0));
}

#[test]
fn tag_expansion_with_override_and_child_inheritance() {
    let doc = preprocess(
        "@component [Button (label: \"ok\", width: 100) [Icon (kind: \"check\")]]\n\
         #component [MyBtn (label: \"go\")]",
    )
    .unwrap();
    assert_eq!(top_ids(&doc), ["MyBtn"]);
    let block = doc.blocks().next().unwrap().clone();
    assert_eq!(prop(&block, "label"), Value::Literal(Literal::String("go".into())));
    assert_eq!(prop(&block, "width"), number(100.0));
    let icon = block.borrow().child_blocks()[0].clone();
    assert_eq!(prop(&icon, "kind"), Value::Literal(Literal::String("check".into())));
}

#[test]
fn two_pass_sibling_reference_with_forward_lookup() {
    let doc = preprocess(
        "[Layout [Content (margin: ($Sidebar.width))] [Sidebar (width: 250)]]",
    )
    .unwrap();
    let layout = doc.blocks().next().unwrap().clone();
    let content = layout.borrow().child_blocks()[0].clone();
    assert_eq!(prop(&content, "margin"), number(250.0));
}

#[tokio::test]
async fn data_source_with_error_path() {
    let preprocessor = Preprocessor::new(PreprocessorConfiguration::new());
    let transaction = Transaction::new();
    transaction.register_data_source("users", || async {
        Err::<EvalValue, _>("connection refused".to_string())
    });

    let doc = preprocessor
        .preprocess_source(
            "<on-data users> [UserList] <on-error> [ErrorBox (msg: ($error.message))] </on-data>"
                .into(),
            None,
            &transaction,
        )
        .await
        .unwrap();

    assert_eq!(top_ids(&doc), ["ErrorBox"]);
    let error_box = doc.blocks().next().unwrap().clone();
    assert_eq!(
        prop(&error_box, "msg"),
        Value::Literal(Literal::String("connection refused".into()))
    );
}

#[test]
fn macro_on_walk_auto_sizing_container() {
    let mut preprocessor = Preprocessor::new(PreprocessorConfiguration::new());
    preprocessor.macros.set_on_walk(|cursor| {
        let block = cursor.block();
        let auto_size = matches!(
            block.borrow().properties.get("auto-size"),
            Some(Value::Literal(Literal::Bool(true)))
        );
        if !auto_size {
            return Ok(());
        }
        let mut total = 0.0;
        for child in cursor.get_remaining_children(block) {
            cursor.invoke_walk(&child, Some(block))?;
            if let Some(Value::Literal(Literal::Number(w))) =
                child.borrow().properties.get("width")
            {
                total += w;
            }
        }
        block
            .borrow_mut()
            .properties
            .insert("width".into(), Value::Literal(Literal::Number(total)));
        Ok(())
    });

    let transaction = Transaction::new();
    let doc = spin_on::spin_on(preprocessor.preprocess_source(
        "[C (auto-size: true) [A (width: 100)] [B (width: 150)] [D (width: 50)]]".into(),
        None,
        &transaction,
    ))
    .unwrap();

    let c = doc.blocks().next().unwrap().clone();
    assert_eq!(prop(&c, "width"), number(300.0));
    let widths: Vec<_> = c.borrow().child_blocks().iter().map(|b| prop(b, "width")).collect();
    assert_eq!(widths, [number(100.0), number(150.0), number(50.0)]);
}

#[test]
fn circular_tag_dependency_does_not_overflow() {
    let err = preprocess("@a [X #b]\n@b [Y #a]\n#a [Root]").unwrap_err();
    match err.kind {
        ErrorKind::CircularTagDependency(chain) => assert_eq!(chain, "a → b → a"),
        other => panic!("expected circular tag error, got {other:?}"),
    }
}

#[test]
fn output_tree_is_pure_data() {
    let doc = preprocess(
        "<set n = 2> \
         @part [P (k: (0 - 1))]\n\
         [Root (a: (n * 10)) \
           <if (n == 2)> #part [Chosen (j: 1)] </if> \
           <foreach x in none_needed_here> [Never] </foreach>]",
    );
    // The foreach collection is undefined, so this errors; build a passing
    // variant and assert the purity invariants on it
    assert!(doc.is_err());

    let doc = preprocess(
        "<set n = 2> \
         @part [P (k: -1)]\n\
         [Root (a: (n * 10)) <if (n == 2)> #part [Chosen (j: 1)] </if>]",
    )
    .unwrap();

    let mut checked = 0;
    recurse_nodes(&doc.nodes, &mut |block| {
        let b = block.borrow();
        assert!(b.tags.is_empty(), "block {:?} kept its tags", b.id);
        fn literal_only(v: &Value) -> bool {
            match v {
                Value::Literal(_) => true,
                Value::Array(elements) => elements.iter().all(literal_only),
                Value::Expression(_) => false,
            }
        }
        for (name, value) in &b.properties {
            assert!(literal_only(value), "property {name} is not literal");
        }
        checked += 1;
    });
    assert_eq!(checked, 2);
}

#[test]
fn while_terminates_or_raises() {
    let doc = preprocess(
        "<set i = 0> <while (i < 4)> [Row (n: (i))] <set i = (i + 1)> </while>",
    )
    .unwrap();
    assert_eq!(doc.blocks().count(), 4);

    let err = preprocess("<while (1 < 2)> [Forever] </while>").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::MaxIterationsExceeded(10_000)));
}

#[test]
fn transaction_variables_are_restored_after_expansion() {
    let preprocessor = Preprocessor::new(PreprocessorConfiguration::new());
    let transaction = Transaction::new();
    transaction.set_variable("x", EvalValue::String("before".into()));

    spin_on::spin_on(preprocessor.preprocess_source(
        "<set items = {1, 2}> <foreach x, idx in items> [B (v: (x))] </foreach>".into(),
        None,
        &transaction,
    ))
    .unwrap();

    assert_eq!(transaction.variable("x"), Some(EvalValue::String("before".into())));
    assert_eq!(transaction.variable("idx"), None);
}

#[tokio::test]
async fn nested_data_sources_run_after_their_parent() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let preprocessor = Preprocessor::new(PreprocessorConfiguration::new());
    let transaction = Transaction::new();
    let order: Rc<RefCell<Vec<&'static str>>> = Default::default();

    let o = order.clone();
    transaction.register_data_source("config", move || {
        let o = o.clone();
        async move {
            o.borrow_mut().push("config");
            Ok(EvalValue::Number(3.0))
        }
    });
    let o = order.clone();
    transaction.register_data_source("details", move || {
        let o = o.clone();
        async move {
            o.borrow_mut().push("details");
            Ok(EvalValue::String("fine".into()))
        }
    });

    let doc = preprocessor
        .preprocess_source(
            "<on-data config> \
               [Cfg (v: (config))] \
               <on-data details> [Det (d: (details))] </on-data> \
             </on-data>"
                .into(),
            None,
            &transaction,
        )
        .await
        .unwrap();

    assert_eq!(*order.borrow(), ["config", "details"]);
    assert_eq!(top_ids(&doc), ["Cfg", "Det"]);
}

#[test]
fn on_parse_macro_can_finish_early() {
    let mut preprocessor = Preprocessor::new(PreprocessorConfiguration::new());
    preprocessor.macros.set_on_parse(|doc, control| {
        // The raw tree still carries templates at this point
        assert!(doc.templates().next().is_some());
        control.finish();
        Ok(())
    });

    let transaction = Transaction::new();
    let doc = spin_on::spin_on(preprocessor.preprocess_source(
        "<set x = 1> [Box (w: (x))]".into(),
        None,
        &transaction,
    ))
    .unwrap();

    // Preprocessing was skipped: the template and the raw expression remain
    assert!(doc.templates().next().is_some());
    let block = doc.blocks().next().unwrap().clone();
    assert!(matches!(prop(&block, "w"), Value::Expression(_)));
}

mod multi_file {
    use super::*;
    use std::fs;

    fn write(dir: &std::path::Path, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    fn preprocessor_for(dir: &std::path::Path) -> Preprocessor {
        Preprocessor::new(PreprocessorConfiguration::with_base_dir(dir))
    }

    #[test]
    fn import_merges_tag_definitions() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "widgets.ox", "@button [B (width: 80, kind: \"plain\")]");
        let main = write(
            dir.path(),
            "main.ox",
            "<import \"./widgets.ox\">\n#button [Ok (kind: \"primary\")]",
        );

        let preprocessor = preprocessor_for(dir.path());
        let transaction = Transaction::new();
        let doc =
            spin_on::spin_on(preprocessor.preprocess_file(&main, &transaction)).unwrap();

        let block = doc.blocks().next().unwrap().clone();
        assert_eq!(prop(&block, "width"), number(80.0));
        assert_eq!(prop(&block, "kind"), Value::Literal(Literal::String("primary".into())));
    }

    #[test]
    fn aliased_import_namespaces_keys() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "widgets.ox", "@button [B (width: 80)]");
        let main = write(
            dir.path(),
            "main.ox",
            "<import \"./widgets.ox\" as ui>\n#ui.button [Ok]",
        );

        let preprocessor = preprocessor_for(dir.path());
        let transaction = Transaction::new();
        let doc =
            spin_on::spin_on(preprocessor.preprocess_file(&main, &transaction)).unwrap();
        let block = doc.blocks().next().unwrap().clone();
        assert_eq!(prop(&block, "width"), number(80.0));

        // The unaliased key was never registered
        let err = spin_on::spin_on(preprocessor.preprocess_source(
            "#button [Nope]".into(),
            None,
            &transaction,
        ))
        .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UndefinedTag(_)));
    }

    #[test]
    fn unaliased_reimport_wins_last() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "one.ox", "@theme [T (color: \"red\")]");
        write(dir.path(), "two.ox", "@theme [T (color: \"blue\")]");
        let main = write(
            dir.path(),
            "main.ox",
            "<import \"./one.ox\">\n<import \"./two.ox\">\n#theme [Chosen]",
        );

        let preprocessor = preprocessor_for(dir.path());
        let transaction = Transaction::new();
        let doc =
            spin_on::spin_on(preprocessor.preprocess_file(&main, &transaction)).unwrap();
        let block = doc.blocks().next().unwrap().clone();
        assert_eq!(prop(&block, "color"), Value::Literal(Literal::String("blue".into())));
    }

    #[test]
    fn inject_splices_preprocessed_blocks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "banner.ox",
            "<set h = 32> [Banner (height: (h * 2))] [Sub]",
        );
        let main = write(
            dir.path(),
            "main.ox",
            "[First]\n<inject \"./banner.ox\">\n[Last]",
        );

        let preprocessor = preprocessor_for(dir.path());
        let transaction = Transaction::new();
        let doc =
            spin_on::spin_on(preprocessor.preprocess_file(&main, &transaction)).unwrap();

        assert_eq!(top_ids(&doc), ["First", "Banner", "Sub", "Last"]);
        let banner = doc.blocks().nth(1).unwrap().clone();
        assert_eq!(prop(&banner, "height"), number(64.0));
        // The injected file ran in its own transaction
        assert_eq!(transaction.variable("h"), None);
    }

    #[test]
    fn inject_works_as_block_child() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "item.ox", "[Injected (v: 1)]");
        let main =
            write(dir.path(), "main.ox", "[Wrap [Before] <inject \"./item.ox\"> [After]]");

        let preprocessor = preprocessor_for(dir.path());
        let transaction = Transaction::new();
        let doc =
            spin_on::spin_on(preprocessor.preprocess_file(&main, &transaction)).unwrap();
        let wrap = doc.blocks().next().unwrap().clone();
        let ids: Vec<_> = wrap
            .borrow()
            .child_blocks()
            .iter()
            .map(|b| b.borrow().id.as_deref().unwrap().to_string())
            .collect();
        assert_eq!(ids, ["Before", "Injected", "After"]);
    }

    #[test]
    fn circular_import_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.ox", "<import \"./b.ox\">\n@a-tag [A]");
        write(dir.path(), "b.ox", "<import \"./a.ox\">\n@b-tag [B]");
        let main = write(dir.path(), "main.ox", "<import \"./a.ox\">\n[Root]");

        let preprocessor = preprocessor_for(dir.path());
        let transaction = Transaction::new();
        let err = spin_on::spin_on(preprocessor.preprocess_file(&main, &transaction))
            .unwrap_err();
        match err.kind {
            ErrorKind::CircularImport(chain) => {
                assert!(chain.contains("a.ox") && chain.contains("b.ox"), "{chain}");
            }
            other => panic!("expected circular import, got {other:?}"),
        }
    }

    #[test]
    fn circular_inject_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "x.ox", "<inject \"./y.ox\">");
        write(dir.path(), "y.ox", "<inject \"./x.ox\">");
        let main = write(dir.path(), "main.ox", "<inject \"./x.ox\">");

        let preprocessor = preprocessor_for(dir.path());
        let transaction = Transaction::new();
        let err = spin_on::spin_on(preprocessor.preprocess_file(&main, &transaction))
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::CircularImport(_)));
    }

    #[test]
    fn package_import_through_module_directory() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "node_modules/ui-kit/ox.config.json",
            "{ \"source\": \"ox\" }",
        );
        write(dir.path(), "node_modules/ui-kit/ox/index.ox", "@chip [C (pad: 4)]");
        let main = write(dir.path(), "main.ox", "<import \"ui-kit\">\n#chip [Tag]");

        let preprocessor = preprocessor_for(dir.path());
        let transaction = Transaction::new();
        let doc =
            spin_on::spin_on(preprocessor.preprocess_file(&main, &transaction)).unwrap();
        let block = doc.blocks().next().unwrap().clone();
        assert_eq!(prop(&block, "pad"), number(4.0));
    }

    #[test]
    fn path_violations_are_rejected() {
        let outer = tempfile::tempdir().unwrap();
        let project = outer.path().join("project");
        fs::create_dir_all(&project).unwrap();
        write(outer.path(), "secret.ox", "[Secret]");

        // Escaping baseDir
        let main = write(&project, "main.ox", "<inject \"../secret.ox\">");
        let preprocessor = preprocessor_for(&project);
        let transaction = Transaction::new();
        let err = spin_on::spin_on(preprocessor.preprocess_file(&main, &transaction))
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::PathEscapesBase(_)));

        // Wrong extension
        write(&project, "notes.txt", "[X]");
        let main2 = write(&project, "main2.ox", "<inject \"./notes.txt\">");
        let err = spin_on::spin_on(preprocessor.preprocess_file(&main2, &transaction))
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidExtension(_)));

        // Illegal character
        let main3 = write(&project, "main3.ox", "<inject \"./bad|name.ox\">");
        let err = spin_on::spin_on(preprocessor.preprocess_file(&main3, &transaction))
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidPathCharacter(_)));
    }

    #[test]
    fn file_size_cap_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let big = format!("[Big (s: \"{}\")]", "x".repeat(64));
        write(dir.path(), "big.ox", &big);
        let main = write(dir.path(), "main.ox", "<inject \"./big.ox\">");

        // Large enough for main.ox, too small for big.ox
        let mut config = PreprocessorConfiguration::with_base_dir(dir.path());
        config.max_file_size = 32;
        let preprocessor = Preprocessor::new(config);
        let transaction = Transaction::new();
        let err = spin_on::spin_on(preprocessor.preprocess_file(&main, &transaction))
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::FileTooLarge { .. }));
    }

    #[test]
    fn reserved_alias_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "w.ox", "@b [B]");
        let main = write(dir.path(), "main.ox", "<import \"./w.ox\" as foreach>\n[Root]");
        let preprocessor = preprocessor_for(dir.path());
        let transaction = Transaction::new();
        let err = spin_on::spin_on(preprocessor.preprocess_file(&main, &transaction))
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ReservedAlias(_)));
    }
}
