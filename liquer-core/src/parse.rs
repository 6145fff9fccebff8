//! Parser turning query and key text into [Query] and [Key].
//!
//! Built from nom combinators over a [LocatedSpan], so every parsed node and every
//! parse error knows where it is in the original text.
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1, take_while_m_n};
use nom::character::complete::{char, digit1};
use nom::combinator::{eof, not, opt, peek, recognize, value};
use nom::multi::{many0, many1, separated_list0, separated_list1};
use nom::sequence::{preceded, terminated};
use nom::{IResult, Parser};
use nom_locate::LocatedSpan;

use crate::error::Error;
use crate::query::{
    ActionParameter, ActionRequest, HeaderParameter, Key, Position, Query, QuerySegment,
    ResourceName, ResourceQuerySegment, SegmentHeader, TransformQuerySegment,
};

type Span<'a> = LocatedSpan<&'a str>;

impl<'a> From<Span<'a>> for Position {
    fn from(span: Span<'a>) -> Position {
        Position::new(
            span.location_offset(),
            span.location_line(),
            span.get_utf8_column(),
        )
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_lowercase() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_parameter_char(c: char) -> bool {
    is_name_char(c) || c == '+' || c == '.'
}

fn is_resource_start(c: char) -> bool {
    is_name_char(c) || c == '.'
}

fn is_resource_char(c: char) -> bool {
    is_resource_start(c) || c == '-'
}

fn fragment_text(span: Span) -> String {
    span.fragment().to_string()
}

/// Non-empty run of literal characters
fn run_of(accept: fn(char) -> bool) -> impl FnMut(Span) -> IResult<Span, String> {
    move |text| take_while1(accept).map(fragment_text).parse(text)
}

/// Percent-encoded bytes such as `%C3%A9`, decoded as UTF-8
fn percent_encoded(text: Span) -> IResult<Span, String> {
    many1(preceded(
        char('%'),
        take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
    ))
    .map(|pairs: Vec<Span>| {
        let bytes: Vec<u8> = pairs
            .iter()
            .filter_map(|pair| u8::from_str_radix(pair.fragment(), 16).ok())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    })
    .parse(text)
}

/// `~` escapes, the inverse of the substitutions made by `encode_token`.
/// `~123` stands for `-123`.
fn entity(text: Span) -> IResult<Span, String> {
    let named = alt((
        value("~", tag("~~")),
        value("-", tag("~_")),
        value(" ", tag("~.")),
        value("/", tag("~I")),
        value("/", tag("~/")),
        value("http://", tag("~h")),
        value("https://", tag("~H")),
        value("file://", tag("~f")),
        value("://", tag("~P")),
    ))
    .map(|decoded: &str| decoded.to_owned());
    let negative_number =
        preceded(char('~'), digit1).map(|digits: Span| format!("-{}", digits.fragment()));
    alt((named, negative_number)).parse(text)
}

/// Possibly empty text made of literal runs, percent escapes and entities
fn decoded(accept: fn(char) -> bool) -> impl FnMut(Span) -> IResult<Span, String> {
    move |text| {
        many0(alt((run_of(accept), percent_encoded, entity)))
            .map(|parts: Vec<String>| parts.concat())
            .parse(text)
    }
}

fn identifier(text: Span) -> IResult<Span, String> {
    recognize((take_while1(is_name_start), take_while(is_name_char)))
        .map(fragment_text)
        .parse(text)
}

/// A name with a dot, e.g. `data.csv`; ends a transform segment
fn filename(text: Span) -> IResult<Span, String> {
    recognize((
        take_while(is_name_char),
        char('.'),
        take_while1(is_resource_char),
    ))
    .map(fragment_text)
    .parse(text)
}

fn resource_name(text: Span) -> IResult<Span, ResourceName> {
    let position = Position::from(text);
    let (text, (first, rest)) = (
        alt((run_of(is_resource_start), percent_encoded, entity)),
        decoded(is_resource_char),
    )
        .parse(text)?;
    Ok((
        text,
        ResourceName::new(first + &rest).with_position(position),
    ))
}

fn resource_names(text: Span) -> IResult<Span, Vec<ResourceName>> {
    separated_list1(char('/'), resource_name).parse(text)
}

/// `~X~query~E`
fn link_parameter(text: Span) -> IResult<Span, ActionParameter> {
    let position = Position::from(text);
    let (text, query) = preceded(tag("~X~"), embedded_query).parse(text)?;
    let (text, _) = tag("~E").parse(text)?;
    Ok((text, ActionParameter::Link(query, position)))
}

fn string_parameter(text: Span) -> IResult<Span, ActionParameter> {
    let position = Position::from(text);
    let (text, parameter) = decoded(is_parameter_char)(text)?;
    Ok((text, ActionParameter::String(parameter, position)))
}

fn action_request(text: Span) -> IResult<Span, ActionRequest> {
    let position = Position::from(text);
    let (text, name) = identifier(text)?;
    let (text, parameters) =
        many0(preceded(char('-'), alt((link_parameter, string_parameter)))).parse(text)?;
    Ok((
        text,
        ActionRequest::new(name)
            .with_parameters(parameters)
            .with_position(position),
    ))
}

fn header_parameter(text: Span) -> IResult<Span, HeaderParameter> {
    let (text, _) = char('-').parse(text)?;
    let position = Position::from(text);
    let (text, parameter) = decoded(is_parameter_char)(text)?;
    Ok((text, HeaderParameter::new(parameter).with_position(position)))
}

/// `-/`, `--/` or `-name-p1-p2/`
fn transform_header(text: Span) -> IResult<Span, SegmentHeader> {
    let position = Position::from(text);
    let (text, dashes) = many1(char('-')).parse(text)?;
    let (text, named) = opt((
        recognize((
            take_while1(|c: char| c.is_ascii_lowercase()),
            take_while(is_name_char),
        )),
        many0(header_parameter),
    ))
    .parse(text)?;
    let (text, _) = char('/').parse(text)?;
    let (name, parameters) = named
        .map(|(name, parameters)| (fragment_text(name), parameters))
        .unwrap_or_default();
    Ok((
        text,
        SegmentHeader {
            name,
            level: dashes.len(),
            parameters,
            resource: false,
            position,
        },
    ))
}

/// `-R`, `-Rname` or `-R-p1`, not including the following slash
fn resource_header(text: Span) -> IResult<Span, SegmentHeader> {
    let position = Position::from(text);
    let (text, dashes) = many1(char('-')).parse(text)?;
    let (text, _) = char('R').parse(text)?;
    let (text, name) = take_while(is_name_char).parse(text)?;
    let (text, parameters) = many0(header_parameter).parse(text)?;
    Ok((
        text,
        SegmentHeader {
            name: fragment_text(name),
            level: dashes.len(),
            parameters,
            resource: true,
            position,
        },
    ))
}

fn resource_segment(text: Span) -> IResult<Span, ResourceQuerySegment> {
    let (text, header) = resource_header(text)?;
    let (text, names) = opt(preceded(char('/'), resource_names)).parse(text)?;
    Ok((
        text,
        ResourceQuerySegment {
            header: Some(header),
            key: Key(names.unwrap_or_default()),
        },
    ))
}

/// A slash between actions; `/-` opens a new segment instead
fn action_separator(text: Span) -> IResult<Span, char> {
    terminated(char('/'), peek(not(char('-')))).parse(text)
}

enum LastStep {
    Filename(ResourceName),
    Action(ActionRequest),
}

fn last_step(text: Span) -> IResult<Span, LastStep> {
    let position = Position::from(text);
    alt((
        filename.map(|name| LastStep::Filename(ResourceName::new(name).with_position(position.clone()))),
        action_request.map(LastStep::Action),
    ))
    .parse(text)
}

/// Actions of a transform segment without its header
fn transform_body(text: Span) -> IResult<Span, TransformQuerySegment> {
    let (text, mut query) = many0(terminated(action_request, action_separator)).parse(text)?;
    let (text, last) = last_step(text)?;
    let filename = match last {
        LastStep::Filename(name) => Some(name),
        LastStep::Action(action) => {
            query.push(action);
            None
        }
    };
    Ok((
        text,
        TransformQuerySegment {
            header: None,
            query,
            filename,
        },
    ))
}

fn headed_transform(text: Span) -> IResult<Span, TransformQuerySegment> {
    let (text, header) = transform_header(text)?;
    let (text, mut segment) = transform_body(text)?;
    segment.header = Some(header);
    Ok((text, segment))
}

/// The first segment may be a transformation without a header
fn first_segment(text: Span) -> IResult<Span, QuerySegment> {
    alt((
        resource_segment.map(QuerySegment::Resource),
        alt((transform_body, headed_transform)).map(QuerySegment::Transform),
    ))
    .parse(text)
}

fn next_segment(text: Span) -> IResult<Span, QuerySegment> {
    alt((
        resource_segment.map(QuerySegment::Resource),
        headed_transform.map(QuerySegment::Transform),
    ))
    .parse(text)
}

fn absolute_mark(text: Span) -> IResult<Span, bool> {
    opt(char('/')).map(|mark| mark.is_some()).parse(text)
}

/// `abc-def/xyz`
fn plain_transform(text: Span) -> IResult<Span, Query> {
    let (text, absolute) = absolute_mark(text)?;
    let (text, segment) = transform_body(text)?;
    Ok((
        text,
        Query {
            segments: vec![QuerySegment::Transform(segment)],
            absolute,
        },
    ))
}

/// `dir/file.txt/-/action`, a resource without its `-R` header followed by a headed transform
fn resource_then_transform(text: Span) -> IResult<Span, Query> {
    let (text, absolute) = absolute_mark(text)?;
    let (text, names) = resource_names(text)?;
    let (text, _) = char('/').parse(text)?;
    let (text, segment) = headed_transform(text)?;
    Ok((
        text,
        Query {
            segments: vec![
                QuerySegment::Resource(ResourceQuerySegment {
                    header: None,
                    key: Key(names),
                }),
                QuerySegment::Transform(segment),
            ],
            absolute,
        },
    ))
}

fn segmented(text: Span) -> IResult<Span, Query> {
    let (text, absolute) = absolute_mark(text)?;
    let (text, first) = first_segment(text)?;
    let (text, rest) = many0(preceded(char('/'), next_segment)).parse(text)?;
    Ok((
        text,
        Query {
            segments: std::iter::once(first).chain(rest).collect(),
            absolute,
        },
    ))
}

fn empty(text: Span) -> IResult<Span, Query> {
    let (text, absolute) = absolute_mark(text)?;
    Ok((
        text,
        Query {
            segments: Vec::new(),
            absolute,
        },
    ))
}

fn whole_query(text: Span) -> IResult<Span, Query> {
    alt((
        terminated(resource_then_transform, eof),
        terminated(plain_transform, eof),
        segmented,
        empty,
    ))
    .parse(text)
}

/// Query inside a link; it ends where `~E` starts
fn embedded_query(text: Span) -> IResult<Span, Query> {
    alt((
        terminated(resource_then_transform, peek(tag("~E"))),
        terminated(plain_transform, peek(tag("~E"))),
        segmented,
        empty,
    ))
    .parse(text)
}

fn key_path(text: Span) -> IResult<Span, Vec<ResourceName>> {
    separated_list0(char('/'), resource_name).parse(text)
}

/// Run `parser` over the whole text; leftover text is reported at its position
fn parse_all<T>(
    text: &str,
    mut parser: impl FnMut(Span) -> IResult<Span, T>,
    error: impl Fn(&str, &Position) -> Error,
) -> Result<T, Error> {
    match parser(Span::new(text)) {
        Ok((rest, parsed)) if rest.fragment().is_empty() => Ok(parsed),
        Ok((rest, _)) => Err(error("unexpected character", &Position::from(rest))),
        Err(e) => Err(error(&e.to_string(), &Position::unknown())),
    }
}

/// Parse a query. A single trailing slash is ignored, so `abc/` parses as `abc`.
pub fn parse_query(query: &str) -> Result<Query, Error> {
    let text = match query.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() && !stripped.ends_with('~') => stripped,
        _ => query,
    };
    parse_all(text, whole_query, |message, position| {
        Error::query_parse_error(query, message, position)
    })
}

pub fn parse_key<S: AsRef<str>>(key: S) -> Result<Key, Error> {
    let key = key.as_ref();
    parse_all(key, key_path, |message, position| {
        Error::key_parse_error(key, message, position)
    })
    .map(Key)
}

impl TryFrom<&str> for Key {
    type Error = Error;
    fn try_from(text: &str) -> Result<Self, Self::Error> {
        parse_key(text)
    }
}

impl TryFrom<String> for Key {
    type Error = Error;
    fn try_from(text: String) -> Result<Self, Self::Error> {
        parse_key(text)
    }
}

impl TryFrom<&str> for Query {
    type Error = Error;
    fn try_from(text: &str) -> Result<Self, Self::Error> {
        parse_query(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorType;

    fn encoded_splits(query: &str) -> Result<Vec<(String, String)>, Error> {
        let mut splits = Vec::new();
        let mut current = parse_query(query)?;
        loop {
            match current.predecessor() {
                (Some(head), Some(tail)) => {
                    splits.push((head.encode(), tail.encode()));
                    current = head;
                }
                (None, None) => return Ok(splits),
                (head, tail) => panic!("unbalanced split {:?} {:?}", head, tail),
            }
        }
    }

    #[test]
    fn action_with_parameters() -> Result<(), Box<dyn std::error::Error>> {
        let (rest, action) = action_request(Span::new("add-1--x"))?;
        assert!(rest.fragment().is_empty());
        assert_eq!(action.name, "add");
        let values: Vec<_> = action.parameters.iter().filter_map(|p| p.string_value()).collect();
        assert_eq!(values, vec!["1", "", "x"]);
        Ok(())
    }

    #[test]
    fn filenames_need_a_dot() -> Result<(), Box<dyn std::error::Error>> {
        let (_, name) = filename(Span::new("report_2.tar.gz"))?;
        assert_eq!(name, "report_2.tar.gz");
        assert!(filename(Span::new("report")).is_err());
        let q = parse_query("a/b/out.txt")?;
        assert_eq!(q.filename().map(|f| f.name), Some("out.txt".to_owned()));
        assert_eq!(q.segments[0].len(), 2);
        Ok(())
    }

    #[test]
    fn segments_are_counted() -> Result<(), Error> {
        assert!(parse_query("")?.is_empty());
        assert_eq!(parse_query("abc-def/xxx-123")?.len(), 1);
        assert_eq!(parse_query("-R/a/b/c")?.len(), 1);
        assert_eq!(parse_query("-R/a/b/-/c/d")?.len(), 2);
        assert_eq!(parse_query("a/b/-/c/d")?.len(), 2);
        assert_eq!(parse_query("abc/def/-/xxx/-/yyy")?.len(), 3);
        assert_eq!(parse_query("-R/abc/def/-q/xxx/-q/qqq")?.len(), 3);
        Ok(())
    }

    #[test]
    fn entities_decode() -> Result<(), Error> {
        let q = parse_query("x-~~-~_-~I-~/-~.-~h-~H-~f-~P-~1")?;
        let values: Vec<_> = q
            .action()
            .map(|a| a.parameters.iter().filter_map(|p| p.string_value()).collect())
            .unwrap_or_default();
        assert_eq!(
            values,
            vec!["~", "-", "/", "/", " ", "http://", "https://", "file://", "://", "-1"]
        );
        Ok(())
    }

    #[test]
    fn percent_escapes_decode() -> Result<(), Error> {
        let q = parse_query("x-a%3Ab-%C3%A9")?;
        let values: Vec<_> = q.action_requests()[0]
            .parameters
            .iter()
            .filter_map(|p| p.string_value())
            .collect();
        assert_eq!(values, vec!["a:b", "é"]);
        assert_eq!(q.encode(), "x-a%3Ab-%C3%A9");
        assert_eq!(parse_key("dir/my%20file.txt")?[1].name, "my file.txt");
        Ok(())
    }

    #[test]
    fn canonical_text_is_stable() -> Result<(), Error> {
        for text in [
            "abc",
            "abc-def/xyz-1-2",
            "abc/file.txt",
            "-R",
            "-R/a/b",
            "-R/a/b/-/world",
            "-R-meta/-/dr",
            "/abc-def",
            "abc/def/-/xxx/-q/qqq",
            "-R/abc/def/-/ghi/jkl/file.txt",
            "value-1/add-~X~add-2~E",
            "a-~X~-R/x/y/-/b~E-c",
            "x-~Hexample.com~Ia.csv",
            "x-hello~.world",
            "--/a",
        ] {
            assert_eq!(parse_query(text)?.encode(), text);
        }
        assert_eq!(parse_query("abc/def/-/xxx")?.encode(), "-R/abc/def/-/xxx");
        assert_eq!(parse_query("abc/def/")?.encode(), "abc/def");
        Ok(())
    }

    #[test]
    fn links_hold_queries() -> Result<(), Error> {
        let q = parse_query("value-1/add-~X~add-2~E")?;
        let link = &q.action_requests()[1].parameters[0];
        assert!(link.is_link());
        assert_eq!(link.position().offset, 12);
        assert_eq!(link.link_value().map(|l| l.encode()), Some("add-2".to_owned()));
        let absolute = parse_query("a-~X~/b/c~E")?
            .action()
            .and_then(|a| a.parameters[0].link_value());
        assert_eq!(absolute.map(|l| (l.absolute, l.encode())), Some((true, "/b/c".to_owned())));
        Ok(())
    }

    #[test]
    fn errors_point_at_leftover_text() {
        let e = parse_query("abc/d$ef").unwrap_err();
        assert_eq!(e.error_type, ErrorType::ParseError);
        assert_eq!(e.position.offset, 5);
        let e = parse_key("a/b$").unwrap_err();
        assert_eq!(e.error_type, ErrorType::ParseError);
        assert_eq!(e.position.offset, 3);
    }

    #[test]
    fn namespaces() -> Result<(), Error> {
        let q = parse_query("ns-abc")?;
        assert!(q.is_ns());
        assert_eq!(q.ns().map(|ns| ns[0].encode()), Some("abc".to_owned()));
        let q = parse_query("ns-abc/test")?;
        assert!(!q.is_ns());
        assert_eq!(q.last_ns().map(|ns| ns.len()), Some(1));
        assert!(parse_query("test")?.last_ns().is_none());
        Ok(())
    }

    #[test]
    fn resource_header_parameters() -> Result<(), Error> {
        let q = parse_query("-R-meta/-/dr")?;
        let header = q.segments[0]
            .as_resource()
            .and_then(|r| r.header.clone())
            .ok_or_else(|| Error::general_error("missing header".to_owned()))?;
        assert!(header.resource);
        assert_eq!(header.level, 1);
        assert_eq!(header.parameters[0].value, "meta");
        let q = parse_query("-R/abc/def/-/ghi/jkl/file.txt")?;
        assert_eq!(q.extension(), Some("txt".to_owned()));
        Ok(())
    }

    #[test]
    fn separator_does_not_open_segments() -> Result<(), Box<dyn std::error::Error>> {
        let (rest, _) = action_separator(Span::new("/x"))?;
        assert_eq!(*rest.fragment(), "x");
        assert!(action_separator(Span::new("/")).is_ok());
        assert!(action_separator(Span::new("/-")).is_err());
        let q = parse_query("abc/def/-/xxx/yyy")?;
        assert!(q.segments.iter().all(|s| s.is_transform_query_segment()));
        Ok(())
    }

    #[test]
    fn predecessors_peel_one_step() -> Result<(), Error> {
        assert_eq!(
            encoded_splits("-x/ghi/jkl/file.txt")?,
            vec![
                ("-x/ghi/jkl".to_owned(), "-x/file.txt".to_owned()),
                ("-x/ghi".to_owned(), "-x/jkl".to_owned()),
                ("".to_owned(), "-x/ghi".to_owned()),
            ]
        );
        assert_eq!(
            encoded_splits("-R/abc/def/-x/ghi/jkl/file.txt")?,
            vec![
                ("-R/abc/def/-x/ghi/jkl".to_owned(), "-x/file.txt".to_owned()),
                ("-R/abc/def/-x/ghi".to_owned(), "-x/jkl".to_owned()),
                ("-R/abc/def".to_owned(), "-x/ghi".to_owned()),
            ]
        );
        Ok(())
    }

    #[test]
    fn resources_are_not_split() -> Result<(), Error> {
        assert_eq!(
            encoded_splits("-R/x/y/-R/a/b/-/c/d")?,
            vec![
                ("-R/x/y/-R/a/b/-/c".to_owned(), "-/d".to_owned()),
                ("-R/x/y/-R/a/b".to_owned(), "-/c".to_owned()),
                ("-R/x/y".to_owned(), "-R/a/b".to_owned()),
            ]
        );
        Ok(())
    }

    #[test]
    fn predecessor_chain_accumulates_remainders() -> Result<(), Error> {
        let chain = parse_query("ghi/jkl/file.txt")?.all_predecessors();
        let encoded: Vec<_> = chain
            .iter()
            .map(|(head, tail)| {
                (
                    head.as_ref().map(|h| h.encode()),
                    tail.as_ref().map(|t| t.encode()),
                )
            })
            .collect();
        assert_eq!(
            encoded,
            vec![
                (Some("ghi/jkl/file.txt".to_owned()), None),
                (Some("ghi/jkl".to_owned()), Some("file.txt".to_owned())),
                (Some("ghi".to_owned()), Some("jkl/file.txt".to_owned())),
            ]
        );
        Ok(())
    }

    #[test]
    fn predecessor_tuples_end_with_resource() -> Result<(), Error> {
        let tuples: Vec<_> = parse_query("-R/xxx/yyy/-/ghi/jkl/file.txt")?
            .all_predecessor_tuples()
            .iter()
            .map(|(head, tail)| format!("{} | {}", head.encode(), tail.encode()))
            .collect();
        assert_eq!(
            tuples,
            vec![
                "-R/xxx/yyy/-/ghi/jkl | -/file.txt",
                "-R/xxx/yyy/-/ghi | -/jkl",
                "-R/xxx/yyy | -/ghi",
                " | -R/xxx/yyy"
            ]
        );
        Ok(())
    }

    #[test]
    fn split_and_rejoin() -> Result<(), Error> {
        let (head, tail) = parse_query("ghi/jkl/file.txt")?.predecessor();
        let head = head.and_then(|h| h.segments[0].transform_query_segment());
        let tail = tail.and_then(|t| t.transform_query_segment());
        match (head, tail) {
            (Some(head), Some(tail)) => {
                assert_eq!(tail.encode(), "file.txt");
                assert_eq!((head + tail).encode(), "ghi/jkl/file.txt");
            }
            other => panic!("unexpected split {:?}", other),
        }
        Ok(())
    }
}
