use std::str::FromStr;

use nom::{
    bytes::complete::{tag_no_case, take_till1, take_while1, take_while_m_n},
    character::complete::{char, digit1, space1},
    combinator::{all_consuming, map, map_res, opt, recognize, rest},
    sequence::{preceded, terminated, tuple},
    IResult,
};

use crate::error::{Error, Result};
use crate::types::{Message, Method, Request, Response, Uri};

// SIP-Version = "SIP" "/" 1*DIGIT "." 1*DIGIT
fn sip_version(input: &str) -> IResult<&str, &str> {
    recognize(tuple((tag_no_case("SIP/"), digit1, char('.'), digit1)))(input)
}

fn method_token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c))(input)
}

/// Request-Line = Method SP Request-URI SP SIP-Version
pub fn request_line(input: &str) -> IResult<&str, (&str, &str, &str)> {
    all_consuming(tuple((
        terminated(method_token, char(' ')),
        terminated(take_till1(|c: char| c == ' '), char(' ')),
        sip_version,
    )))(input)
}

/// Status-Line = SIP-Version SP Status-Code SP Reason-Phrase
///
/// A missing reason phrase is tolerated.
pub fn status_line(input: &str) -> IResult<&str, (&str, u16, &str)> {
    all_consuming(tuple((
        terminated(sip_version, space1),
        map_res(take_while_m_n(3, 3, |c: char| c.is_ascii_digit()), u16::from_str),
        map(opt(preceded(space1, rest)), |reason: Option<&str>| reason.unwrap_or("")),
    )))(input)
}

pub(crate) fn parse_start_line(line: &str) -> Result<Message> {
    let line = line.trim_end();
    let not_sip = || Error::Syntax(format!("transmission beginning '{}' is not a SIP message", line));

    if line.len() >= 4 && line[..4].eq_ignore_ascii_case("SIP/") {
        let (_, (version, status, reason)) = status_line(line).map_err(|_| not_sip())?;
        if !(100..700).contains(&status) {
            return Err(Error::Syntax(format!("status code {} out of range", status)));
        }
        let mut res = Response::new(status, reason.trim());
        res.version = version.to_string();
        return Ok(Message::Response(res));
    }

    let (_, (method, uri, version)) = request_line(line).map_err(|_| not_sip())?;
    let mut req = Request::new(method.parse::<Method>()?, uri.parse::<Uri>()?);
    req.version = version.to_string();
    Ok(Message::Request(req))
}
