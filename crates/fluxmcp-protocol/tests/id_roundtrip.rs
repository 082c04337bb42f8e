//! Property coverage for the id and token sum types.

use fluxmcp_protocol::{ProgressToken, RequestId};
use proptest::prelude::*;

proptest! {
    #[test]
    fn numeric_ids_round_trip(n in any::<i64>()) {
        let id = RequestId::Number(n);
        let json = serde_json::to_string(&id).unwrap();
        prop_assert!(!json.contains('.'));
        let back: RequestId = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, id);
    }

    #[test]
    fn string_ids_round_trip(s in "\\PC*") {
        let id = RequestId::String(s);
        let json = serde_json::to_string(&id).unwrap();
        let back: RequestId = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, id);
    }

    #[test]
    fn id_kinds_never_collide(n in any::<i64>()) {
        let number = RequestId::Number(n);
        let string = RequestId::String(n.to_string());
        prop_assert_ne!(number, string);
    }

    #[test]
    fn progress_tokens_round_trip(n in any::<i64>(), s in "\\PC*") {
        for token in [ProgressToken::Number(n), ProgressToken::String(s)] {
            let json = serde_json::to_string(&token).unwrap();
            let back: ProgressToken = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, token);
        }
    }
}
