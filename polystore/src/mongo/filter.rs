//! Filter rendering for the document engine.

use mongodb::bson::{doc, to_bson, Bson, Document};

use polystore_core::filter::{ensure_valid_identifier, Node};
use polystore_core::{Cond, DalResult, DataAccessError, Filter, Op};

/// Render a filter to a BSON query document. An empty filter becomes the
/// match-all document.
pub fn render(filter: &Filter) -> DalResult<Document> {
    match &filter.root {
        None => Ok(Document::new()),
        Some(node) => render_node(node),
    }
}

fn render_node(node: &Node) -> DalResult<Document> {
    match node {
        Node::Cond(cond) => render_cond(cond),
        Node::And(nodes) => {
            let parts: Vec<Document> = nodes.iter().map(render_node).collect::<DalResult<_>>()?;
            Ok(doc! { "$and": parts })
        }
        Node::Or(nodes) => {
            let parts: Vec<Document> = nodes.iter().map(render_node).collect::<DalResult<_>>()?;
            Ok(doc! { "$or": parts })
        }
    }
}

fn render_cond(cond: &Cond) -> DalResult<Document> {
    ensure_valid_identifier(&cond.field)?;
    let field = cond.field.as_str();

    let value = || -> DalResult<Bson> {
        to_bson(&cond.value).map_err(|err| {
            DataAccessError::validation(format!(
                "filter value for '{field}' does not convert to BSON: {err}"
            ))
        })
    };

    let document = match cond.op {
        Op::Eq => doc! { field: value()? },
        Op::Ne => doc! { field: { "$ne": value()? } },
        Op::Gt => doc! { field: { "$gt": value()? } },
        Op::Ge => doc! { field: { "$gte": value()? } },
        Op::Lt => doc! { field: { "$lt": value()? } },
        Op::Le => doc! { field: { "$lte": value()? } },
        Op::Like => {
            let pattern = cond.value.as_str().ok_or_else(|| {
                DataAccessError::validation(format!(
                    "LIKE condition on '{field}' requires a string pattern"
                ))
            })?;
            doc! { field: { "$regex": like_to_regex(pattern) } }
        }
        Op::In => {
            let serde_json::Value::Array(_) = &cond.value else {
                return Err(DataAccessError::validation(format!(
                    "IN condition on '{field}' requires an array value"
                )));
            };
            doc! { field: { "$in": value()? } }
        }
        Op::IsNull => doc! { field: Bson::Null },
        Op::NotNull => doc! { field: { "$ne": Bson::Null } },
    };
    Ok(document)
}

/// Translate a SQL `LIKE` pattern into an anchored regex: `%` matches any
/// run, `_` a single character, everything else literally.
fn like_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            c if ".^$*+?()[]{}|\\".contains(c) => {
                regex.push('\\');
                regex.push(c);
            }
            c => regex.push(c),
        }
    }
    regex.push('$');
    regex
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn eq_renders_direct_match() {
        let d = render(&Filter::by(Cond::eq("status", "expired"))).unwrap();
        assert_eq!(d, doc! { "status": "expired" });
    }

    #[test]
    fn groups_use_logical_operators() {
        let f = Filter::by(Cond::eq("a", 1)).and(Cond::gt("b", 2));
        let d = render(&f).unwrap();
        assert_eq!(
            d,
            doc! { "$and": [ { "a": 1i64 }, { "b": { "$gt": 2i64 } } ] }
        );
    }

    #[test]
    fn empty_filter_matches_all() {
        assert_eq!(render(&Filter::new()).unwrap(), Document::new());
    }

    #[test]
    fn in_requires_array() {
        let bad = Filter::by(Cond {
            field: "id".into(),
            op: Op::In,
            value: json!(1),
        });
        assert!(render(&bad).is_err());

        let good = Filter::by(Cond::is_in("id", [1, 2]));
        let d = render(&good).unwrap();
        assert_eq!(d, doc! { "id": { "$in": [1i64, 2i64] } });
    }

    #[test]
    fn like_translation_escapes_and_anchors() {
        assert_eq!(like_to_regex("abc%"), "^abc.*$");
        assert_eq!(like_to_regex("a_c"), "^a.c$");
        assert_eq!(like_to_regex("50%+"), "^50.*\\+$");
    }

    #[test]
    fn invalid_field_names_rejected() {
        let f = Filter::by(Cond::eq("$where", 1));
        assert!(render(&f).is_err());
    }
}
