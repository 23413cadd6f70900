use judge_sdk::errors::{JudgeError, JudgeErrorExt};
use judge_sdk::types::{ArgSchema, ArgumentProblem, FieldSpec, FieldType};
use proptest::prelude::*;
use serde_json::{json, Value};

fn search_schema() -> ArgSchema {
    ArgSchema::new(vec![
        FieldSpec::required("query", FieldType::String),
        FieldSpec::optional("max_results", FieldType::Integer),
        FieldSpec::optional("safe", FieldType::Boolean),
    ])
}

// Error hints never echo caller-controlled text
proptest! {
    #[test]
    fn test_error_user_hint_completeness(error_str in "\\PC*") {
        let errs = vec![
            JudgeError::Config(error_str.clone()),
            JudgeError::Database(error_str.clone()),
            JudgeError::UnknownTool(error_str.clone()),
            JudgeError::BackendUnavailable(error_str.clone()),
            JudgeError::MalformedDecision(error_str.clone()),
            JudgeError::InvalidArguments { tool: error_str.clone(), problems: vec![error_str.clone()] },
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            if error_str.len() > 12 {
                prop_assert!(!hint.contains(&error_str));
            }
        }
    }
}

// A valid object never loses its required field, and any object lacking it
// is always rejected with a Missing problem.
proptest! {
    #[test]
    fn test_required_field_enforced(
        query in proptest::option::of("[a-z ]{1,20}"),
        max_results in proptest::option::of(0..100i64),
    ) {
        let mut args = serde_json::Map::new();
        if let Some(q) = &query {
            args.insert("query".to_string(), json!(q));
        }
        if let Some(n) = max_results {
            args.insert("max_results".to_string(), json!(n));
        }

        let result = search_schema().validate(&Value::Object(args));
        match query {
            Some(q) => {
                let validated = result.expect("valid arguments rejected");
                prop_assert_eq!(validated.get("query"), Some(&json!(q)));
            }
            None => {
                let problems = result.expect_err("missing query accepted");
                prop_assert!(problems.contains(&ArgumentProblem::Missing("query".to_string())));
            }
        }
    }

    #[test]
    fn test_mistyped_field_always_reported(flag in "[a-z]{1,8}") {
        let args = json!({"query": "paris", "safe": flag.clone()});
        let problems = search_schema().validate(&args).expect_err("string accepted as boolean");
        prop_assert_eq!(problems, vec![ArgumentProblem::WrongType {
            field: "safe".to_string(),
            expected: FieldType::Boolean,
            found: "string",
        }]);
    }
}
