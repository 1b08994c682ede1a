use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while1},
    character::complete::space1,
    combinator::{eof, map, rest, value},
    multi::separated_list1,
    sequence::{preceded, separated_pair, terminated},
    IResult, Parser,
};

/// A single `attr=value` pair of an XFORWARD command.
pub type XForwardAttr<'a> = (&'a [u8], &'a [u8]);

/// Client command lines the phase tracker reacts to. Everything else is relayed
/// without interpretation.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientLine<'a> {
    /// XFORWARD command with its attributes, in the order they were sent
    XForward(Vec<XForwardAttr<'a>>),
    /// DATA command
    Data,
    Other,
}

impl ClientLine<'_> {
    /// Returns true for an `XFORWARD NAME=... SOURCE=LOCAL` line, i.e. a message
    /// resubmitted by the local mail system.
    pub fn is_local_source(&self) -> bool {
        match self {
            ClientLine::XForward(attrs) => {
                let starts_with_name = attrs
                    .first()
                    .is_some_and(|(name, _)| name.eq_ignore_ascii_case(b"NAME"));
                starts_with_name
                    && attrs.iter().any(|(name, value)| {
                        name.eq_ignore_ascii_case(b"SOURCE") && value.eq_ignore_ascii_case(b"LOCAL")
                    })
            }
            _ => false,
        }
    }
}

/// Parses one client line (with or without its trailing CRLF).
pub fn parse_client_line(line: &[u8]) -> ClientLine<'_> {
    let line = trim_line_end(line);
    alt((parse_data, parse_xforward))
        .parse(line)
        .map(|(_, cmd)| cmd)
        .unwrap_or(ClientLine::Other)
}

/// Returns the raw attribute text of an XFORWARD line, e.g. `NAME=a ADDR=b`.
pub fn xforward_arguments(line: &[u8]) -> Option<&[u8]> {
    let parsed: IResult<&[u8], &[u8]> =
        preceded((tag_no_case("XFORWARD"), space1), rest).parse(trim_line_end(line));
    parsed.ok().map(|(_, args)| args)
}

fn parse_data(input: &[u8]) -> IResult<&[u8], ClientLine<'_>> {
    value(ClientLine::Data, terminated(tag_no_case("DATA"), eof)).parse(input)
}

fn parse_xforward(input: &[u8]) -> IResult<&[u8], ClientLine<'_>> {
    map(
        preceded(
            (tag_no_case("XFORWARD"), space1),
            separated_list1(
                space1,
                separated_pair(take_while1(is_attr_char), tag("="), take_while1(is_value_char)),
            ),
        ),
        ClientLine::XForward,
    )
    .parse(input)
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|b| !matches!(b, b'\r' | b'\n' | b' ' | b'\t'))
        .map_or(0, |pos| pos + 1);
    &line[..end]
}

fn is_attr_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'-' || c == b'_'
}

fn is_value_char(c: u8) -> bool {
    !matches!(c, b' ' | b'\t' | b'\r' | b'\n')
}
