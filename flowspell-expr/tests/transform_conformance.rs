//! Conformance sweep over the transform sub-language surface

use flowspell_expr::{evaluate, expand_string};
use serde_json::{json, Map, Value};

fn scope(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("scope must be an object"),
    }
}

#[test]
fn property_and_index_access() {
    let s = scope(json!({
        "input": {"files": [{"name": "a.rs"}, {"name": "b.rs"}]}
    }));
    assert_eq!(evaluate("input.files[1].name", &s).unwrap(), json!("b.rs"));
    assert_eq!(evaluate("input.files.length", &s).unwrap(), json!(2));
    assert_eq!(evaluate("input['files'][0]['name']", &s).unwrap(), json!("a.rs"));
}

#[test]
fn arithmetic_comparisons_logic_ternary() {
    let s = scope(json!({"input": 7}));
    assert_eq!(evaluate("input * 2 + 1", &s).unwrap(), json!(15));
    assert_eq!(evaluate("input % 2", &s).unwrap(), json!(1));
    assert_eq!(evaluate("input >= 7 && input < 8", &s).unwrap(), json!(true));
    assert_eq!(evaluate("!(input == 7) || input === 7", &s).unwrap(), json!(true));
    assert_eq!(
        evaluate("input > 5 ? 'high' : 'low'", &s).unwrap(),
        json!("high")
    );
    assert_eq!(evaluate("-input", &s).unwrap(), json!(-7));
}

#[test]
fn string_method_chain() {
    let s = scope(json!({"input": "  Server.LOG  "}));
    assert_eq!(
        evaluate("input.trim().toLowerCase().split('.')", &s).unwrap(),
        json!(["server", "log"])
    );
    assert_eq!(
        evaluate("input.trim().startsWith('Server')", &s).unwrap(),
        json!(true)
    );
    assert_eq!(
        evaluate("input.trim().endsWith('LOG')", &s).unwrap(),
        json!(true)
    );
    assert_eq!(
        evaluate("input.includes('LOG')", &s).unwrap(),
        json!(true)
    );
    assert_eq!(
        evaluate("'a'.concat('b', 'c').toUpperCase()", &s).unwrap(),
        json!("ABC")
    );
}

#[test]
fn array_pipeline_with_lambdas() {
    let s = scope(json!({"input": ["main.rs", "lib.ts", "mod.rs", "view.tsx"]}));
    assert_eq!(
        evaluate(
            "input.filter(f => f.endsWith('.rs')).map(f => f.toUpperCase()).join(', ')",
            &s
        )
        .unwrap(),
        json!("MAIN.RS, MOD.RS")
    );
    assert_eq!(
        evaluate("input.slice(1, 3).concat(['extra'])", &s).unwrap(),
        json!(["lib.ts", "mod.rs", "extra"])
    );
    assert_eq!(
        evaluate("input.filter(f => f.includes('.ts')).length", &s).unwrap(),
        json!(2)
    );
}

#[test]
fn math_and_object_namespaces() {
    let s = scope(json!({"input": {"a": 3, "b": 9}}));
    assert_eq!(
        evaluate("Math.max(input.a, input.b, 5)", &s).unwrap(),
        json!(9)
    );
    assert_eq!(
        evaluate("Math.min(input.a, input.b)", &s).unwrap(),
        json!(3)
    );
    assert_eq!(evaluate("Math.round(2.4)", &s).unwrap(), json!(2));
    assert_eq!(evaluate("Math.floor(9 / 2)", &s).unwrap(), json!(4));
    assert_eq!(evaluate("Math.ceil(9 / 2)", &s).unwrap(), json!(5));
    assert_eq!(
        evaluate("Object.keys(input).join('+')", &s).unwrap(),
        json!("a+b")
    );
    assert_eq!(
        evaluate("Object.entries(input).length", &s).unwrap(),
        json!(2)
    );
}

#[test]
fn purity_same_input_same_output() {
    let s = scope(json!({"input": [3, 1, 2]}));
    let first = evaluate("input.map(x => x * 10).join('-')", &s).unwrap();
    for _ in 0..5 {
        assert_eq!(
            evaluate("input.map(x => x * 10).join('-')", &s).unwrap(),
            first
        );
    }
}

#[test]
fn template_round_trips_preserve_types() {
    let s = scope(json!({
        "state": {"counts": [1, 2, 3], "flag": true},
    }));
    assert_eq!(expand_string("{{ state.counts }}", &s), json!([1, 2, 3]));
    assert_eq!(expand_string("{{ state.flag }}", &s), json!(true));
    assert_eq!(
        expand_string("flag={{ state.flag }} n={{ state.counts.length }}", &s),
        json!("flag=true n=3")
    );
}

#[test]
fn deterministic_flattening_of_conditionals() {
    let s = scope(json!({"input": null}));
    // null coalescing via || and ternary over the absence sentinel
    assert_eq!(evaluate("input || 'default'", &s).unwrap(), json!("default"));
    assert_eq!(
        evaluate("input ? 'set' : 'unset'", &s).unwrap(),
        json!("unset")
    );
}
