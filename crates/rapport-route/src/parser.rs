use winnow::ascii::multispace0;
use winnow::combinator::{opt, repeat};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{literal, take_while};
use winnow::{ModalResult, Parser};

use rapport_types::{Node, RapportError};

use crate::ast::{is_name_char, ArrowStyle, Route};

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

/// Whitespace consumer.
fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// State or trigger name: one or more alphanumerics / underscores.
fn name<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    take_while(1.., is_name_char).parse_next(input)
}

/// One or more repetitions of the stem.
fn stem_run(input: &mut &str, style: &ArrowStyle) -> ModalResult<usize> {
    repeat(1.., literal(style.stem.as_str())).parse_next(input)
}

/// `name ( sep name )*` inside brackets.
fn trigger_list(input: &mut &str, style: &ArrowStyle) -> ModalResult<Vec<String>> {
    let first = name
        .context(StrContext::Expected(StrContextValue::Description(
            "trigger name",
        )))
        .parse_next(input)?;
    let mut triggers = vec![first.to_string()];
    loop {
        let _ = ws.parse_next(input)?;
        if opt(literal(style.separator.as_str()))
            .parse_next(input)?
            .is_none()
        {
            break;
        }
        let _ = ws.parse_next(input)?;
        let next = name
            .context(StrContext::Expected(StrContextValue::Description(
                "trigger name after separator",
            )))
            .parse_next(input)?;
        if !triggers.iter().any(|t| t == next) {
            triggers.push(next.to_string());
        }
    }
    Ok(triggers)
}

/// `stem+ ( open triggers close stem+ )? tip`
fn arrow(input: &mut &str, style: &ArrowStyle) -> ModalResult<Vec<String>> {
    stem_run(input, style)?;

    let mut triggers = Vec::new();
    if opt(literal(style.brackets.0.as_str()))
        .parse_next(input)?
        .is_some()
    {
        let _ = ws.parse_next(input)?;
        triggers = trigger_list(input, style)?;
        let _ = ws.parse_next(input)?;
        let _ = literal(style.brackets.1.as_str())
            .context(StrContext::Expected(StrContextValue::Description(
                "closing bracket",
            )))
            .parse_next(input)?;
        stem_run(input, style).map_err(|_| make_cut_error("arrow stem after bracket"))?;
    }

    let _ = literal(style.tip.as_str())
        .context(StrContext::Expected(StrContextValue::Description(
            "arrow tip",
        )))
        .parse_next(input)?;
    Ok(triggers)
}

/// `name` or `name arrow name`, surrounded by optional whitespace.
fn route_expr(input: &mut &str, style: &ArrowStyle) -> ModalResult<Route> {
    let _ = ws.parse_next(input)?;
    let source = name
        .context(StrContext::Expected(StrContextValue::Description(
            "state name",
        )))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    if input.is_empty() {
        return Ok(Route::Node {
            node: Node::from(source),
        });
    }

    let triggers = arrow(input, style)?;
    let _ = ws.parse_next(input)?;
    let target = name
        .context(StrContext::Expected(StrContextValue::Description(
            "edge target state name",
        )))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;

    if !input.is_empty() {
        if input.starts_with(style.stem.as_str()) {
            return Err(make_cut_error(
                "a single arrow (chained arrows are ambiguous)",
            ));
        }
        return Err(make_cut_error("end of route"));
    }

    Ok(Route::Edge {
        source: Node::from(source),
        target: Node::from(target),
        triggers,
    })
}

/// Parse a route expression written in `style`.
pub fn parse_route(text: &str, style: &ArrowStyle) -> rapport_types::Result<Route> {
    let mut remaining = text;
    route_expr(&mut remaining, style).map_err(|e| {
        let col = text.len() - remaining.len() + 1;
        let message = match format!("{}", e).trim() {
            "" => "unparseable route".to_string(),
            m => m.to_string(),
        };
        RapportError::RouteSyntax {
            route: text.to_string(),
            col,
            message,
        }
    })
}
