//! Transform Script Parser
//!
//! Parses transform scripts into the [`Script`] AST.
//!
//! # Supported Syntax
//!
//! ```text
//! get <path>
//! pick <path> [as <name>] [, <path> [as <name>] ...]
//! where <path> (== | != | > | >= | < | <= | ~=) <literal>
//! sort <path> [asc | desc]
//! limit <n>
//! flatten
//! wrap <name>
//! count
//! ```
//!
//! Stages are separated by `|`. Literals are numbers, single or double quoted
//! strings, `true`, `false` and `null`.

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{map, map_res, opt, value},
    multi::separated_list1,
    number::complete::double,
    sequence::{delimited, preceded},
    IResult,
};
use serde_json::Value;

use super::ast::*;
use super::TransformError;

/// Parse a transform script
pub fn parse_script(input: &str) -> Result<Script, TransformError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(Script::default());
    }

    match parse_pipeline(input) {
        Ok((remaining, stages)) => {
            if remaining.trim().is_empty() {
                Ok(Script { stages })
            } else {
                Err(TransformError::Parse(format!(
                    "Unexpected input: '{}'",
                    remaining.trim()
                )))
            }
        }
        Err(e) => Err(TransformError::Parse(format!("{:?}", e))),
    }
}

fn parse_pipeline(input: &str) -> IResult<&str, Vec<Stage>> {
    separated_list1(
        delimited(multispace0, char('|'), multispace0),
        parse_stage,
    )(input)
}

fn parse_stage(input: &str) -> IResult<&str, Stage> {
    alt((
        parse_get,
        parse_pick,
        parse_where,
        parse_sort,
        parse_limit,
        parse_wrap,
        value(Stage::Flatten, tag_no_case("flatten")),
        value(Stage::Count, tag_no_case("count")),
    ))(input)
}

fn parse_get(input: &str) -> IResult<&str, Stage> {
    let (input, _) = tag_no_case("get")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, path) = parse_path(input)?;
    Ok((input, Stage::Get(path.to_string())))
}

fn parse_pick(input: &str) -> IResult<&str, Stage> {
    let (input, _) = tag_no_case("pick")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, projections) = separated_list1(
        delimited(multispace0, char(','), multispace0),
        parse_projection,
    )(input)?;
    Ok((input, Stage::Pick(projections)))
}

fn parse_projection(input: &str) -> IResult<&str, Projection> {
    let (input, path) = parse_path(input)?;
    let (input, alias) = opt(preceded(
        delimited(multispace1, tag_no_case("as"), multispace1),
        parse_identifier,
    ))(input)?;

    Ok((
        input,
        Projection {
            path: path.to_string(),
            alias: alias.map(str::to_string),
        },
    ))
}

fn parse_where(input: &str) -> IResult<&str, Stage> {
    let (input, _) = tag_no_case("where")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, path) = parse_path(input)?;
    let (input, _) = multispace0(input)?;
    let (input, op) = parse_compare_op(input)?;
    let (input, _) = multispace0(input)?;
    let (input, literal) = parse_literal(input)?;

    Ok((
        input,
        Stage::Where {
            path: path.to_string(),
            op,
            literal,
        },
    ))
}

fn parse_sort(input: &str) -> IResult<&str, Stage> {
    let (input, _) = tag_no_case("sort")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, path) = parse_path(input)?;
    let (input, direction) = opt(preceded(
        multispace1,
        alt((
            value(false, tag_no_case("asc")),
            value(true, tag_no_case("desc")),
        )),
    ))(input)?;

    Ok((
        input,
        Stage::Sort {
            path: path.to_string(),
            descending: direction.unwrap_or(false),
        },
    ))
}

fn parse_limit(input: &str) -> IResult<&str, Stage> {
    let (input, _) = tag_no_case("limit")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, n) = map_res(digit1, |s: &str| s.parse::<usize>())(input)?;
    Ok((input, Stage::Limit(n)))
}

fn parse_wrap(input: &str) -> IResult<&str, Stage> {
    let (input, _) = tag_no_case("wrap")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, name) = parse_identifier(input)?;
    Ok((input, Stage::Wrap(name.to_string())))
}

fn parse_compare_op(input: &str) -> IResult<&str, CompareOp> {
    alt((
        value(CompareOp::Gte, tag(">=")),
        value(CompareOp::Lte, tag("<=")),
        value(CompareOp::Eq, tag("==")),
        value(CompareOp::Ne, tag("!=")),
        value(CompareOp::Contains, tag("~=")),
        value(CompareOp::Gt, tag(">")),
        value(CompareOp::Lt, tag("<")),
    ))(input)
}

fn parse_literal(input: &str) -> IResult<&str, Value> {
    alt((
        value(Value::Bool(true), tag_no_case("true")),
        value(Value::Bool(false), tag_no_case("false")),
        value(Value::Null, tag_no_case("null")),
        map(parse_quoted, |s: &str| Value::String(s.to_string())),
        map(double, number_value),
    ))(input)
}

fn parse_quoted(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('"'), take_while(|c| c != '"'), char('"')),
        delimited(char('\''), take_while(|c| c != '\''), char('\'')),
    ))(input)
}

/// Dot path: letters, digits and `_ - . @ # $`
fn parse_path(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| {
        c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '@' | '#' | '$')
    })(input)
}

fn parse_identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_')(input)
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_empty_script() {
        let script = parse_script("   ").unwrap();
        assert!(script.is_identity());
    }

    #[test]
    fn test_parse_full_pipeline() {
        let script = parse_script(
            "get data.items | where price > 100 | sort price desc | pick symbol, price as p | limit 5",
        )
        .unwrap();

        assert_eq!(script.stages.len(), 5);
        assert_eq!(script.stages[0], Stage::Get("data.items".into()));
        assert_eq!(
            script.stages[1],
            Stage::Where {
                path: "price".into(),
                op: CompareOp::Gt,
                literal: json!(100)
            }
        );
        assert_eq!(
            script.stages[2],
            Stage::Sort {
                path: "price".into(),
                descending: true
            }
        );
        match &script.stages[3] {
            Stage::Pick(fields) => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[1].alias.as_deref(), Some("p"));
            }
            other => panic!("Expected pick, got {:?}", other),
        }
        assert_eq!(script.stages[4], Stage::Limit(5));
    }

    #[test]
    fn test_parse_literals() {
        let script = parse_script(
            "where a == 'x y' | where b != true | where c >= -2.5 | where d ~= \"btc\" | where e == null",
        )
        .unwrap();

        let literals: Vec<Value> = script
            .stages
            .iter()
            .map(|s| match s {
                Stage::Where { literal, .. } => literal.clone(),
                _ => Value::Null,
            })
            .collect();

        assert_eq!(
            literals,
            vec![json!("x y"), json!(true), json!(-2.5), json!("btc"), Value::Null]
        );
    }

    #[test]
    fn test_parse_keyword_stages() {
        let script = parse_script("FLATTEN | Count").unwrap();
        assert_eq!(script.stages, vec![Stage::Flatten, Stage::Count]);

        let script = parse_script("wrap records").unwrap();
        assert_eq!(script.stages, vec![Stage::Wrap("records".into())]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_script("fetch http://evil").is_err());
        assert!(parse_script("limit many").is_err());
        assert!(parse_script("get a | ").is_err());
        assert!(parse_script("count extra").is_err());
    }
}
