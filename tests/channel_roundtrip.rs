//! Channel codec round-trips and name stability.

use serde_json::{json, Map, Value};

use lodestone::channel::{
    parse_channel_resource_query, routed_view_params, stable_stringify, view_channel,
    ChannelQuery,
};
use lodestone::ViewSchema;

fn map(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

#[test]
fn test_view_channel_round_trip_recovers_primary_params() {
    let view = ViewSchema::new()
        .with_param_fields(["owner", "kind"])
        .with_primary_fields(["owner"]);
    let supplied = map(json!({"owner": "u1", "kind": "tool"}));

    let routed = routed_view_params(&view, Some(&supplied), false);
    let name = view_channel("byOwner", "Item", &routed);
    assert_eq!(name, r#"crud>byOwner({"owner":"u1"}):Item"#);

    match parse_channel_resource_query(&name) {
        Some(ChannelQuery::View {
            view,
            model,
            view_params,
        }) => {
            assert_eq!(view, "byOwner");
            assert_eq!(model, "Item");
            assert_eq!(view_params, Some(routed), "params survive the round trip");
        }
        other => panic!("expected a view channel query, got {other:?}"),
    }
}

#[test]
fn test_missing_primary_params_round_trip_as_null() {
    let view = ViewSchema::new().with_primary_fields(["owner"]);
    let routed = routed_view_params(&view, None, false);
    let name = view_channel("byOwner", "Item", &routed);
    assert_eq!(name, r#"crud>byOwner({"owner":null}):Item"#);

    match parse_channel_resource_query(&name) {
        Some(ChannelQuery::View { view_params, .. }) => {
            assert_eq!(view_params.unwrap().get("owner"), Some(&Value::Null));
        }
        other => panic!("expected a view channel query, got {other:?}"),
    }
}

#[test]
fn test_key_permutation_yields_identical_channel_names() {
    let view = ViewSchema::new().with_param_fields(["b", "a", "c"]);
    let ordered = map(json!({"a": 1, "b": "x", "c": true}));
    let permuted = map(json!({"c": true, "a": 1, "b": "x"}));

    let left = view_channel("v", "T", &routed_view_params(&view, Some(&ordered), false));
    let right = view_channel("v", "T", &routed_view_params(&view, Some(&permuted), false));
    assert_eq!(left, right);
}

#[test]
fn test_numeric_params_match_string_params_by_default() {
    let view = ViewSchema::new().with_param_fields(["n"]);
    let numeric = view_channel("v", "T", &routed_view_params(&view, Some(&map(json!({"n": 7}))), false));
    let stringy = view_channel("v", "T", &routed_view_params(&view, Some(&map(json!({"n": "7"}))), false));
    assert_eq!(
        numeric, stringy,
        "default coercion keeps channel names invariant across JSON input types"
    );
}

#[test]
fn test_typed_params_distinguish_numbers_from_strings() {
    let view = ViewSchema::new().with_param_fields(["n"]);
    let numeric = view_channel("v", "T", &routed_view_params(&view, Some(&map(json!({"n": 7}))), true));
    let stringy = view_channel("v", "T", &routed_view_params(&view, Some(&map(json!({"n": "7"}))), true));
    assert_ne!(numeric, stringy);
}

#[test]
fn test_stable_stringify_nested_structures() {
    let value = json!({
        "z": [{"b": 2, "a": 1}, null],
        "a": {"y": true, "x": "s"}
    });
    assert_eq!(
        stable_stringify(&value),
        r#"{"a":{"x":"s","y":true},"z":[{"a":1,"b":2},null]}"#
    );
}
