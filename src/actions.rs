use serde_json::Value;

use crate::config::{CONFIG_FILE, Config};
use crate::paths::{PathError, RepoPath};

/// A mutation proposed by the model, before any vetting. The path is kept as
/// the raw string the model produced so path-syntax rejection can report it
/// verbatim.
#[derive(Debug, Clone)]
pub struct ProposedAction {
    pub path: String,
    pub op: ProposedOp,
}

#[derive(Debug, Clone)]
pub enum ProposedOp {
    CreateOrUpdate(Vec<u8>),
    Delete,
}

/// The ordered actions extracted from one model reply. Order matters for
/// logging only; application is order-independent.
#[derive(Debug, Clone, Default)]
pub struct ActionSet {
    pub actions: Vec<ProposedAction>,
}

impl ActionSet {
    /// Interpret a JSON object against the reply schema:
    ///
    /// ```text
    /// { "create-or-update": { <path>: <string contents>, ... },
    ///   "delete": [ <path>, ... ] }
    /// ```
    ///
    /// Both fields default to empty when absent; additional top-level fields
    /// are ignored. Returns `Err` with a reason when a present field has the
    /// wrong shape.
    pub fn from_value(value: &Value) -> Result<ActionSet, String> {
        let object = value
            .as_object()
            .ok_or_else(|| "reply payload is not a JSON object".to_string())?;

        let mut actions = Vec::new();

        if let Some(creates) = object.get("create-or-update") {
            let map = creates
                .as_object()
                .ok_or_else(|| "'create-or-update' is not an object".to_string())?;
            for (path, contents) in map {
                let contents = contents.as_str().ok_or_else(|| {
                    format!("'create-or-update' entry '{}' is not a string", path)
                })?;
                actions.push(ProposedAction {
                    path: path.clone(),
                    op: ProposedOp::CreateOrUpdate(contents.as_bytes().to_vec()),
                });
            }
        }

        if let Some(deletes) = object.get("delete") {
            let list = deletes
                .as_array()
                .ok_or_else(|| "'delete' is not an array".to_string())?;
            for entry in list {
                let path = entry
                    .as_str()
                    .ok_or_else(|| "'delete' entry is not a string".to_string())?;
                actions.push(ProposedAction {
                    path: path.to_string(),
                    op: ProposedOp::Delete,
                });
            }
        }

        Ok(ActionSet { actions })
    }

    /// Whether a JSON object looks like the reply schema at all. Used when
    /// scanning a freeform reply for the action payload: an object qualifies
    /// if it carries at least one schema key of the right type, or is empty
    /// (the model proposing nothing).
    pub fn value_matches_schema(value: &Value) -> bool {
        let Some(object) = value.as_object() else {
            return false;
        };
        let create_ok = object.get("create-or-update").map(Value::is_object);
        let delete_ok = object.get("delete").map(Value::is_array);
        match (create_ok, delete_ok) {
            (Some(true), Some(true)) | (Some(true), None) | (None, Some(true)) => true,
            (None, None) => object.is_empty(),
            _ => false,
        }
    }
}

/// A vetted mutation with a normalized path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateOrUpdate { path: RepoPath, contents: Vec<u8> },
    Delete { path: RepoPath },
}

impl Action {
    pub fn path(&self) -> &RepoPath {
        match self {
            Action::CreateOrUpdate { path, .. } => path,
            Action::Delete { path } => path,
        }
    }
}

/// The write-policy category of a path. Every path has exactly one class;
/// when rules overlap the strictest wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionClass {
    Immutable,
    ApprovalRequired,
    Free,
}

const VCS_DIR: &str = ".git";
const SPECS_DIR: &str = "specs";

/// Classify a path under the layered write policy. Pure in the path and the
/// config.
pub fn classify(path: &RepoPath, config: &Config) -> ProtectionClass {
    if path.as_str() == VCS_DIR || path.is_under(VCS_DIR) || path.as_str() == CONFIG_FILE {
        return ProtectionClass::Immutable;
    }

    let is_checker = config
        .correctness_checker
        .as_ref()
        .is_some_and(|checker| checker == path);
    let listed = config
        .edits_require_approval
        .iter()
        .any(|entry| entry == path || path.is_under(entry.as_str()));

    if path.is_under(SPECS_DIR) || is_checker || listed {
        return ProtectionClass::ApprovalRequired;
    }

    ProtectionClass::Free
}

/// An action dropped before classification because its path failed syntax
/// checks.
#[derive(Debug)]
pub struct SyntaxRejection {
    pub path: String,
    pub reason: PathError,
}

/// Validator output: three disjoint ordered sets plus the path-syntax drops,
/// which are logged but never halt the loop.
#[derive(Debug, Default)]
pub struct ValidatedActions {
    pub accepted: Vec<Action>,
    pub approval_pending: Vec<Action>,
    pub rejected_printed: Vec<Action>,
    pub rejected_syntax: Vec<SyntaxRejection>,
}

/// Vet each proposed action in order. Checks apply in a fixed sequence and
/// the first failure decides the disposition: path syntax, then
/// immutability, then approval, then acceptance. Symlink safety needs live
/// filesystem state and is the committer's job.
pub fn validate(set: ActionSet, config: &Config) -> ValidatedActions {
    let mut validated = ValidatedActions::default();

    for proposed in set.actions {
        let path = match RepoPath::parse(&proposed.path) {
            Ok(path) => path,
            Err(reason) => {
                validated.rejected_syntax.push(SyntaxRejection {
                    path: proposed.path,
                    reason,
                });
                continue;
            }
        };

        let action = match proposed.op {
            ProposedOp::CreateOrUpdate(contents) => Action::CreateOrUpdate { path, contents },
            ProposedOp::Delete => Action::Delete { path },
        };

        match classify(action.path(), config) {
            ProtectionClass::Immutable => validated.rejected_printed.push(action),
            ProtectionClass::ApprovalRequired => validated.approval_pending.push(action),
            ProtectionClass::Free => validated.accepted.push(action),
        }
    }

    validated
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_with(checker: Option<&str>, approval: &[&str]) -> Config {
        Config {
            correctness_checker: checker.map(|c| RepoPath::parse(c).unwrap()),
            edits_require_approval: approval
                .iter()
                .map(|p| RepoPath::parse(p).unwrap())
                .collect(),
        }
    }

    #[test]
    fn parses_reply_object() {
        let value = json!({
            "create-or-update": { "src/a.rs": "fn a() {}\n", "b.txt": "b" },
            "delete": ["old.rs"],
            "commentary": "ignored"
        });
        let set = ActionSet::from_value(&value).unwrap();
        assert_eq!(set.actions.len(), 3);
        assert!(matches!(set.actions[2].op, ProposedOp::Delete));
    }

    #[test]
    fn absent_fields_default_to_empty() {
        let set = ActionSet::from_value(&json!({})).unwrap();
        assert!(set.actions.is_empty());
    }

    #[test]
    fn wrong_field_shapes_are_errors() {
        assert!(ActionSet::from_value(&json!({ "create-or-update": [] })).is_err());
        assert!(ActionSet::from_value(&json!({ "delete": {} })).is_err());
        assert!(ActionSet::from_value(&json!({ "create-or-update": { "a": 1 } })).is_err());
        assert!(ActionSet::from_value(&json!({ "delete": [1] })).is_err());
    }

    #[test]
    fn schema_match_requires_a_known_key_or_emptiness() {
        assert!(ActionSet::value_matches_schema(&json!({})));
        assert!(ActionSet::value_matches_schema(&json!({ "delete": [] })));
        assert!(ActionSet::value_matches_schema(
            &json!({ "create-or-update": {}, "other": 3 })
        ));
        assert!(!ActionSet::value_matches_schema(&json!({ "unrelated": true })));
        assert!(!ActionSet::value_matches_schema(&json!({ "delete": "x" })));
        assert!(!ActionSet::value_matches_schema(&json!([1, 2])));
    }

    #[test]
    fn classification_is_total_and_strictest_wins() {
        // A config that lists immutable and spec paths for approval must not
        // weaken them.
        let config = config_with(Some(".config/bork.json"), &[".git/hooks", "specs/api.md"]);

        let immutable = [".git/config", ".git/hooks/pre-commit", ".config/bork.json"];
        for raw in immutable {
            let path = RepoPath::parse(raw).unwrap();
            assert_eq!(classify(&path, &config), ProtectionClass::Immutable, "{}", raw);
        }

        let approval = ["specs/api.md", "specs/sub/deep.md"];
        for raw in approval {
            let path = RepoPath::parse(raw).unwrap();
            assert_eq!(
                classify(&path, &config),
                ProtectionClass::ApprovalRequired,
                "{}",
                raw
            );
        }

        let free = ["src/main.rs", "README.md", "specsish/file.md"];
        for raw in free {
            let path = RepoPath::parse(raw).unwrap();
            assert_eq!(classify(&path, &config), ProtectionClass::Free, "{}", raw);
        }
    }

    #[test]
    fn checker_and_listed_paths_require_approval() {
        let config = config_with(Some("tools/check.sh"), &["deploy"]);

        let checker = RepoPath::parse("tools/check.sh").unwrap();
        assert_eq!(classify(&checker, &config), ProtectionClass::ApprovalRequired);

        // A listed directory protects its subtree.
        let below = RepoPath::parse("deploy/prod.toml").unwrap();
        assert_eq!(classify(&below, &config), ProtectionClass::ApprovalRequired);

        let sibling = RepoPath::parse("deployment.md").unwrap();
        assert_eq!(classify(&sibling, &config), ProtectionClass::Free);
    }

    #[test]
    fn validate_routes_each_disposition() {
        let config = config_with(None, &[]);
        let value = json!({
            "create-or-update": {
                "../evil": "x",
                "/abs": "x",
                "a\u{0}b": "x",
                ".git/config": "hacked",
                "specs/api.md": "# changed",
                "src/ok.rs": "fn main() {}\n"
            },
            "delete": ["gone.txt"]
        });
        let set = ActionSet::from_value(&value).unwrap();
        let validated = validate(set, &config);

        assert_eq!(validated.rejected_syntax.len(), 3);
        assert_eq!(validated.rejected_printed.len(), 1);
        assert_eq!(validated.rejected_printed[0].path().as_str(), ".git/config");
        assert_eq!(validated.approval_pending.len(), 1);
        assert_eq!(validated.approval_pending[0].path().as_str(), "specs/api.md");
        assert_eq!(validated.accepted.len(), 2);
    }

    #[test]
    fn one_bad_path_does_not_drop_the_rest() {
        let config = config_with(None, &[]);
        let value = json!({ "delete": ["../../etc/passwd", "keep/me.txt"] });
        let set = ActionSet::from_value(&value).unwrap();
        let validated = validate(set, &config);
        assert_eq!(validated.rejected_syntax.len(), 1);
        assert_eq!(validated.accepted.len(), 1);
        assert_eq!(validated.accepted[0].path().as_str(), "keep/me.txt");
    }
}
