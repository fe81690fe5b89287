//! Property tests for the channel codec.

use proptest::prelude::*;
use serde_json::{Map, Value};

use lodestone::channel::{parse_channel_resource_query, stable_stringify, view_channel, ChannelQuery};

fn arb_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        "[a-zA-Z0-9_ -]{0,12}".prop_map(Value::String),
    ]
}

fn arb_params() -> impl Strategy<Value = Map<String, Value>> {
    proptest::collection::btree_map("[a-zA-Z][a-zA-Z0-9]{0,8}", arb_scalar(), 0..6).prop_map(
        |entries| {
            let mut map = Map::new();
            for (key, value) in entries {
                map.insert(key, value);
            }
            map
        },
    )
}

proptest! {
    /// Permuting insertion order never changes the serialization.
    #[test]
    fn prop_stable_stringify_ignores_insertion_order(params in arb_params()) {
        let forward = Value::Object(params.clone());
        let mut reversed_map = Map::new();
        for (key, value) in params.iter().collect::<Vec<_>>().into_iter().rev() {
            reversed_map.insert(key.clone(), value.clone());
        }
        let reversed = Value::Object(reversed_map);
        prop_assert_eq!(stable_stringify(&forward), stable_stringify(&reversed));
    }

    /// Any params object survives the channel-name round trip.
    #[test]
    fn prop_view_channel_round_trip(params in arb_params()) {
        let name = view_channel("view", "Model", &params);
        match parse_channel_resource_query(&name) {
            Some(ChannelQuery::View { view, model, view_params }) => {
                prop_assert_eq!(view, "view");
                prop_assert_eq!(model, "Model");
                prop_assert_eq!(view_params, Some(params));
            }
            other => prop_assert!(false, "expected view query, got {:?}", other),
        }
    }

    /// Stable stringification always produces valid JSON.
    #[test]
    fn prop_stable_stringify_is_valid_json(params in arb_params()) {
        let serialized = stable_stringify(&Value::Object(params.clone()));
        let parsed: Value = serde_json::from_str(&serialized).expect("valid JSON");
        prop_assert_eq!(parsed, Value::Object(params));
    }
}
