#![allow(dead_code)]

use crate::context::Context;
use crate::error::Error;
use crate::value::Value;

/// Type identifier of states holding a template
pub const TEMPLATE_TYPE_IDENTIFIER: &str = "template";

/// Piece of a parsed template
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateFragment {
    Text(String),
    /// Query between two `$`, with the offset of the opening `$`
    Query(String, usize),
}

/// Split a template into text and `$query$` placeholders.
/// `$$` stands for a literal `$`.
pub fn parse_template(template: &str) -> Result<Vec<TemplateFragment>, Error> {
    let mut fragments = Vec::new();
    let mut text = String::new();
    let mut rest = template;
    let mut offset = 0;
    while let Some(start) = rest.find('$') {
        text.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        if let Some(stripped) = after.strip_prefix('$') {
            text.push('$');
            offset += start + 2;
            rest = stripped;
            continue;
        }
        let end = after.find('$').ok_or_else(|| {
            Error::general_error(format!(
                "Unterminated query in template at offset {}",
                offset + start
            ))
        })?;
        if !text.is_empty() {
            fragments.push(TemplateFragment::Text(std::mem::take(&mut text)));
        }
        fragments.push(TemplateFragment::Query(
            after[..end].to_owned(),
            offset + start,
        ));
        offset += start + end + 2;
        rest = &after[end + 1..];
    }
    text.push_str(rest);
    if !text.is_empty() {
        fragments.push(TemplateFragment::Text(text));
    }
    Ok(fragments)
}

fn value_to_text(value: &Value) -> Result<String, Error> {
    match value.try_into_string() {
        Ok(text) => Ok(text),
        Err(_) => Ok(value.try_into_json_value()?.to_string()),
    }
}

/// Expand all placeholders by evaluating their queries
pub fn expand_template(context: &mut Context<'_>, template: &str) -> Result<String, Error> {
    let mut result = String::with_capacity(template.len());
    for fragment in parse_template(template)? {
        match fragment {
            TemplateFragment::Text(text) => result.push_str(&text),
            TemplateFragment::Query(query, offset) => {
                let state = context.evaluate(&query)?;
                if state.type_identifier() == TEMPLATE_TYPE_IDENTIFIER {
                    return Err(Error::general_error(format!(
                        "Query '{}' at offset {} in a template returns a template",
                        query, offset
                    )));
                }
                let value = state.get().map_err(|e| e.with_query_text(&query))?;
                result.push_str(&value_to_text(value)?);
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_metadata::{ArgumentInfo, CommandMetadata};
    use crate::context::Environment;

    #[test]
    fn parse_fragments() -> Result<(), Error> {
        let fragments = parse_template("a $x$ costs $$5")?;
        assert_eq!(
            fragments,
            vec![
                TemplateFragment::Text("a ".to_owned()),
                TemplateFragment::Query("x".to_owned(), 2),
                TemplateFragment::Text(" costs $5".to_owned()),
            ]
        );
        assert!(parse_template("open $query").is_err());
        Ok(())
    }

    #[test]
    fn expand_queries() -> Result<(), Error> {
        let env = Environment::new();
        let mut hello = CommandMetadata::first("hello");
        hello.with_argument(ArgumentInfo::string_argument("name"));
        env.register_command(hello, |_, args, _| {
            Ok(Value::from(format!("Hello {}", args.get::<String>(0, "name")?)))
        })?;
        let mut template = CommandMetadata::first("template");
        template.with_argument(ArgumentInfo::string_argument("text"));
        env.register_command(template, |_, args, context| {
            context.set_type_identifier(TEMPLATE_TYPE_IDENTIFIER);
            Ok(Value::from(args.get::<String>(0, "text")?))
        })?;
        let mut context = env.new_context();
        assert_eq!(
            context.evaluate_template("$hello-world$, that is $$1")?,
            "Hello world, that is $1"
        );
        assert!(context.evaluate_template("$template-x$").is_err());
        Ok(())
    }
}
