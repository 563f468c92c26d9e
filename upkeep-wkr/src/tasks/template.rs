//! The small template language used by post-upgrade commands and data
//! files.
//!
//! Supported: `{{{field}}}` (raw), `{{field}}` (HTML escaped), dotted
//! paths, `{{#each list}}`, `{{#if x}}`, `{{#unless x}}` and the `@index`,
//! `@first`, `@last` and `this` names inside `each`. Unknown fields render
//! as empty strings.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template tag starting at byte {0} is not closed")]
    UnterminatedTag(usize),
    #[error("block `{0}` is never closed")]
    UnclosedBlock(String),
    #[error("unexpected closing tag `{0}`")]
    UnexpectedClose(String),
    #[error("unsupported block helper `{0}`")]
    UnknownHelper(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Text(String),
    Var { path: String, escape: bool },
    Each { path: String, body: Vec<Node> },
    Cond { path: String, negate: bool, body: Vec<Node> },
}

/// A parsed template, reusable across contexts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut pos = 0;
        let nodes = parse_nodes(source, &mut pos, None)?;
        Ok(Self { nodes })
    }

    pub fn render(&self, context: &Value) -> String {
        let mut out = String::new();
        let scope = Scope {
            value: context,
            index: None,
            len: 0,
        };
        render_nodes(&self.nodes, &[scope], &mut out);
        out
    }
}

/// Parse and render in one step.
pub fn compile(source: &str, context: &Value) -> Result<String, TemplateError> {
    Ok(Template::parse(source)?.render(context))
}

fn parse_nodes(
    source: &str,
    pos: &mut usize,
    closing: Option<&str>,
) -> Result<Vec<Node>, TemplateError> {
    let mut nodes = Vec::new();
    loop {
        let rest = &source[*pos..];
        let Some(open) = rest.find("{{") else {
            if !rest.is_empty() {
                nodes.push(Node::Text(rest.to_string()));
            }
            *pos = source.len();
            return match closing {
                Some(name) => Err(TemplateError::UnclosedBlock(name.to_string())),
                None => Ok(nodes),
            };
        };
        if open > 0 {
            nodes.push(Node::Text(rest[..open].to_string()));
        }
        let tag_start = *pos + open;

        if rest[open..].starts_with("{{{") {
            let inner_start = tag_start + 3;
            let end = source[inner_start..]
                .find("}}}")
                .ok_or(TemplateError::UnterminatedTag(tag_start))?;
            let path = source[inner_start..inner_start + end].trim().to_string();
            nodes.push(Node::Var { path, escape: false });
            *pos = inner_start + end + 3;
            continue;
        }

        let inner_start = tag_start + 2;
        let end = source[inner_start..]
            .find("}}")
            .ok_or(TemplateError::UnterminatedTag(tag_start))?;
        let tag = source[inner_start..inner_start + end].trim();
        *pos = inner_start + end + 2;

        if let Some(block) = tag.strip_prefix('#') {
            let (helper, arg) = block.split_once(char::is_whitespace).unwrap_or((block, ""));
            let arg = arg.trim().to_string();
            let body = parse_nodes(source, pos, Some(helper))?;
            nodes.push(match helper {
                "each" => Node::Each { path: arg, body },
                "if" => Node::Cond {
                    path: arg,
                    negate: false,
                    body,
                },
                "unless" => Node::Cond {
                    path: arg,
                    negate: true,
                    body,
                },
                other => return Err(TemplateError::UnknownHelper(other.to_string())),
            });
        } else if let Some(name) = tag.strip_prefix('/') {
            let name = name.trim();
            return match closing {
                Some(expected) if expected == name => Ok(nodes),
                _ => Err(TemplateError::UnexpectedClose(name.to_string())),
            };
        } else {
            nodes.push(Node::Var {
                path: tag.to_string(),
                escape: true,
            });
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Scope<'a> {
    value: &'a Value,
    /// Position inside the enclosing `each`, if any.
    index: Option<usize>,
    len: usize,
}

fn render_nodes(nodes: &[Node], scopes: &[Scope<'_>], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var { path, escape } => {
                let text = lookup(scopes, path).map(display).unwrap_or_default();
                if *escape {
                    out.push_str(&escape_html(&text));
                } else {
                    out.push_str(&text);
                }
            }
            Node::Each { path, body } => {
                let Some(Value::Array(items)) = lookup(scopes, path) else {
                    continue;
                };
                for (index, item) in items.iter().enumerate() {
                    let mut inner = scopes.to_vec();
                    inner.push(Scope {
                        value: item,
                        index: Some(index),
                        len: items.len(),
                    });
                    render_nodes(body, &inner, out);
                }
            }
            Node::Cond { path, negate, body } => {
                let truthy = lookup(scopes, path).is_some_and(is_truthy);
                if truthy != *negate {
                    render_nodes(body, scopes, out);
                }
            }
        }
    }
}

static TRUE: Value = Value::Bool(true);
static FALSE: Value = Value::Bool(false);

fn lookup<'a>(scopes: &[Scope<'a>], path: &str) -> Option<&'a Value> {
    let innermost = scopes.last()?;
    match path {
        "this" | "." => return Some(innermost.value),
        "@first" => return Some(if innermost.index == Some(0) { &TRUE } else { &FALSE }),
        "@last" => {
            let last = innermost.index.is_some_and(|i| i + 1 == innermost.len);
            return Some(if last { &TRUE } else { &FALSE });
        }
        _ => {}
    }
    let path = path.strip_prefix("this.").unwrap_or(path);
    scopes.iter().rev().find_map(|scope| {
        path.split('.')
            .try_fold(scope.value, |value, segment| value.get(segment))
    })
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(display).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '`' => out.push_str("&#x60;"),
            '=' => out.push_str("&#x3D;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_and_escaped_fields() {
        let ctx = json!({"depName": "@types/node", "newValue": "<2"});
        assert_eq!(
            compile("npx update {{{depName}}} {{{newValue}}}", &ctx).unwrap(),
            "npx update @types/node <2"
        );
        assert_eq!(compile("{{newValue}}", &ctx).unwrap(), "&lt;2");
        assert_eq!(compile("echo {{missing}}!", &ctx).unwrap(), "echo !");
    }

    #[test]
    fn test_dotted_path() {
        let ctx = json!({"upgrade": {"depName": "lodash"}});
        assert_eq!(compile("{{{upgrade.depName}}}", &ctx).unwrap(), "lodash");
    }

    #[test]
    fn test_each_with_unless_last() {
        let ctx = json!({
            "upgrades": [
                {"depName": "a", "newValue": "1"},
                {"depName": "b", "newValue": "2"}
            ]
        });
        let out = compile(
            r#"[{{#each upgrades}}{"depName": "{{{depName}}}", "newValue": "{{{newValue}}}"}{{#unless @last}},{{/unless}}{{/each}}]"#,
            &ctx,
        )
        .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(
            parsed,
            json!([{"depName": "a", "newValue": "1"}, {"depName": "b", "newValue": "2"}])
        );
    }

    #[test]
    fn test_each_falls_back_to_outer_scope() {
        let ctx = json!({"manager": "npm", "upgrades": [{"depName": "a"}]});
        assert_eq!(
            compile("{{#each upgrades}}{{manager}}:{{depName}}{{/each}}", &ctx).unwrap(),
            "npm:a"
        );
    }

    #[test]
    fn test_if_block() {
        let ctx = json!({"isMajor": true, "count": 0});
        assert_eq!(compile("{{#if isMajor}}major{{/if}}", &ctx).unwrap(), "major");
        assert_eq!(compile("{{#if count}}some{{/if}}", &ctx).unwrap(), "");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Template::parse("{{#each upgrades}}x"),
            Err(TemplateError::UnclosedBlock("each".into()))
        );
        assert_eq!(
            Template::parse("x{{/if}}"),
            Err(TemplateError::UnexpectedClose("if".into()))
        );
        assert_eq!(
            Template::parse("{{#with x}}{{/with}}"),
            Err(TemplateError::UnknownHelper("with".into()))
        );
        assert_eq!(Template::parse("echo {{name"), Err(TemplateError::UnterminatedTag(5)));
    }
}
