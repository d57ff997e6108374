use crate::client_types::SmtpClientTimeouts;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unrecognized command {0}")]
    UnknownCommand(String),
    #[error("{0}")]
    Syntax(String),
}

fn syntax<T, S: Into<String>>(message: S) -> Result<T, ParseError> {
    Err(ParseError::Syntax(message.into()))
}

fn prefix_match(line: &str, candidate: &str) -> bool {
    line.len() >= candidate.len()
        && line.is_char_boundary(candidate.len())
        && line[..candidate.len()].eq_ignore_ascii_case(candidate)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReversePath {
    Path(MailPath),
    NullSender,
}

impl TryFrom<&str> for ReversePath {
    type Error = ParseError;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s.is_empty() {
            Ok(Self::NullSender)
        } else {
            Ok(Self::Path(MailPath::parse(s)?))
        }
    }
}

impl fmt::Display for ReversePath {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Path(p) => p.fmt(fmt),
            Self::NullSender => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardPath {
    Path(MailPath),
    Postmaster,
}

impl TryFrom<&str> for ForwardPath {
    type Error = ParseError;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s.is_empty() {
            syntax("null sender not permitted as a recipient")
        } else if s.eq_ignore_ascii_case("postmaster") {
            Ok(Self::Postmaster)
        } else {
            Ok(Self::Path(MailPath::parse(s)?))
        }
    }
}

impl fmt::Display for ForwardPath {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Path(p) => p.fmt(fmt),
            Self::Postmaster => write!(fmt, "postmaster"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailPath {
    pub at_domain_list: Vec<String>,
    pub mailbox: Mailbox,
}

impl MailPath {
    /// Parse the portion of a path found between the angle brackets,
    /// including the optional source route
    fn parse(text: &str) -> Result<Self, ParseError> {
        let mut at_domain_list = vec![];
        let mut mailbox = text;

        if text.starts_with('@') {
            let (adl, remainder) = match text.split_once(':') {
                Some(pair) => pair,
                None => return syntax(format!("invalid source route in {text:?}")),
            };
            for at_domain in adl.split(',') {
                let domain = match at_domain.strip_prefix('@') {
                    Some(domain) if is_valid_domain(domain) => domain,
                    _ => return syntax(format!("invalid source route in {text:?}")),
                };
                at_domain_list.push(domain.to_string());
            }
            mailbox = remainder;
        }

        Ok(Self {
            at_domain_list,
            mailbox: Mailbox::parse(mailbox)?,
        })
    }
}

impl fmt::Display for MailPath {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        // RFC 5321 says that the source route MUST be accepted,
        // SHOULD NOT be generated and SHOULD be ignored,
        // so it is not part of the stringified form
        self.mailbox.fmt(fmt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub local_part: String,
    pub domain: Domain,
}

impl Mailbox {
    fn parse(text: &str) -> Result<Self, ParseError> {
        let (local_part, domain) = match text.rsplit_once('@') {
            Some(pair) => pair,
            None => return syntax(format!("missing @ in address {text:?}")),
        };

        if !is_valid_local_part(local_part) {
            return syntax(format!("invalid local part in address {text:?}"));
        }

        Ok(Self {
            local_part: local_part.to_string(),
            domain: Domain::parse(domain)?,
        })
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}@{}", self.local_part, self.domain)
    }
}

fn is_valid_local_part(text: &str) -> bool {
    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        return !text[1..text.len() - 1].contains(['\r', '\n']);
    }

    !text.is_empty()
        && text.split('.').all(|atom| {
            !atom.is_empty()
                && atom.chars().all(|c| {
                    c.is_ascii_alphanumeric() || !c.is_ascii() || "!#$%&'*+-/=?^_`{|}~".contains(c)
                })
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Domain {
    Name(String),
    V4(String),
    V6(String),
    Tagged { tag: String, literal: String },
}

impl Domain {
    fn parse(text: &str) -> Result<Self, ParseError> {
        if let Some(literal) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            if prefix_match(literal, "IPv6:") {
                return Ok(Self::V6(literal[5..].to_string()));
            }
            if literal.parse::<Ipv4Addr>().is_ok() {
                return Ok(Self::V4(literal.to_string()));
            }
            return match literal.split_once(':') {
                Some((tag, literal))
                    if is_valid_sub_domain(tag)
                        && !literal.is_empty()
                        && !literal.contains(['[', ']', '\\', ' ']) =>
                {
                    Ok(Self::Tagged {
                        tag: tag.to_string(),
                        literal: literal.to_string(),
                    })
                }
                _ => syntax(format!("invalid address literal {text:?}")),
            };
        }

        if is_valid_domain(text) {
            Ok(Self::Name(text.to_string()))
        } else {
            syntax(format!("invalid domain {text:?}"))
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Name(name) => write!(fmt, "{name}"),
            Self::V4(addr) => write!(fmt, "[{addr}]"),
            Self::V6(addr) => write!(fmt, "[IPv6:{addr}]"),
            Self::Tagged { tag, literal } => write!(fmt, "[{tag}:{literal}]"),
        }
    }
}

fn is_valid_sub_domain(label: &str) -> bool {
    let mut chars = label.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn is_valid_domain(text: &str) -> bool {
    !text.is_empty() && text.split('.').all(is_valid_sub_domain)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpParameter {
    pub name: String,
    pub value: Option<String>,
}

impl EsmtpParameter {
    fn parse(text: &str) -> Result<Self, ParseError> {
        let (name, value) = match text.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (text, None),
        };

        if !name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
            || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return syntax(format!("invalid ESMTP parameter {text:?}"));
        }
        if value.is_some_and(|v| v.is_empty()) {
            return syntax(format!("missing value for ESMTP parameter {name}"));
        }

        Ok(Self {
            name: name.to_string(),
            value: value.map(|v| v.to_string()),
        })
    }
}

impl fmt::Display for EsmtpParameter {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match &self.value {
            Some(value) => write!(fmt, "{}={}", self.name, value),
            None => write!(fmt, "{}", self.name),
        }
    }
}

/// Splits `<path> params` (or a bare `path`) into the path text
/// and the list of ESMTP parameters that follow it
fn split_path_and_params(text: &str) -> Result<(&str, Vec<EsmtpParameter>), ParseError> {
    let text = text.trim_start();

    let (path, remainder) = if let Some(inner) = text.strip_prefix('<') {
        let mut in_quotes = false;
        let mut escaped = false;
        let mut end = None;
        for (idx, c) in inner.char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' if in_quotes => escaped = true,
                '"' => in_quotes = !in_quotes,
                '>' if !in_quotes => {
                    end = Some(idx);
                    break;
                }
                _ => {}
            }
        }
        match end {
            Some(idx) => (&inner[..idx], &inner[idx + 1..]),
            None => return syntax(format!("expected > in {text:?}")),
        }
    } else {
        let (path, remainder) = text.split_once(' ').unwrap_or((text, ""));
        if !remainder.trim().is_empty() {
            return syntax("must enclose address in <> if you want to use ESMTP parameters");
        }
        (path, "")
    };

    if !remainder.is_empty() && !remainder.starts_with(' ') {
        return syntax(format!("unexpected text after path: {remainder:?}"));
    }

    let parameters = remainder
        .split_whitespace()
        .map(EsmtpParameter::parse)
        .collect::<Result<Vec<_>, _>>()?;

    Ok((path, parameters))
}

fn format_parameters(parameters: &[EsmtpParameter]) -> String {
    let mut params = String::new();
    for p in parameters {
        params.push(' ');
        params.push_str(&p.to_string());
    }
    params
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(Domain),
    Helo(Domain),
    Lhlo(Domain),
    MailFrom {
        address: ReversePath,
        parameters: Vec<EsmtpParameter>,
    },
    RcptTo {
        address: ForwardPath,
        parameters: Vec<EsmtpParameter>,
    },
    Data,
    DataDot,
    Rset,
    Quit,
    Vrfy(String),
    Expn(String),
    Help(Option<String>),
    Noop(Option<String>),
    StartTls,
    Auth {
        sasl_mech: String,
        initial_response: Option<String>,
    },
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, args) = line.split_once(' ').unwrap_or((line, ""));

        fn no_args(cmd: Command, args: &str) -> Result<Command, ParseError> {
            if args.trim().is_empty() {
                Ok(cmd)
            } else {
                syntax(format!("unexpected parameters {args:?}"))
            }
        }

        fn hello_domain(args: &str) -> Result<Domain, ParseError> {
            let args = args.trim();
            if args.is_empty() {
                return syntax("domain name is required");
            }
            // Some clients append a greeting after the domain
            let domain = args.split(' ').next().unwrap_or(args);
            Domain::parse(domain)
        }

        fn optional_arg(args: &str) -> Option<String> {
            let args = args.trim();
            if args.is_empty() {
                None
            } else {
                Some(args.to_string())
            }
        }

        fn required_arg(args: &str) -> Result<String, ParseError> {
            optional_arg(args).ok_or_else(|| ParseError::Syntax("parameter is required".into()))
        }

        if verb.eq_ignore_ascii_case("EHLO") {
            Ok(Self::Ehlo(hello_domain(args)?))
        } else if verb.eq_ignore_ascii_case("HELO") {
            Ok(Self::Helo(hello_domain(args)?))
        } else if verb.eq_ignore_ascii_case("LHLO") {
            Ok(Self::Lhlo(hello_domain(args)?))
        } else if verb.eq_ignore_ascii_case("MAIL") {
            if !prefix_match(args, "FROM:") {
                return syntax("expected MAIL FROM:");
            }
            let (path, parameters) = split_path_and_params(&args[5..])?;
            Ok(Self::MailFrom {
                address: ReversePath::try_from(path)?,
                parameters,
            })
        } else if verb.eq_ignore_ascii_case("RCPT") {
            if !prefix_match(args, "TO:") {
                return syntax("expected RCPT TO:");
            }
            let (path, parameters) = split_path_and_params(&args[3..])?;
            Ok(Self::RcptTo {
                address: ForwardPath::try_from(path)?,
                parameters,
            })
        } else if verb.eq_ignore_ascii_case("DATA") {
            no_args(Self::Data, args)
        } else if verb.eq_ignore_ascii_case("RSET") {
            no_args(Self::Rset, args)
        } else if verb.eq_ignore_ascii_case("QUIT") {
            no_args(Self::Quit, args)
        } else if verb.eq_ignore_ascii_case("STARTTLS") {
            no_args(Self::StartTls, args)
        } else if verb.eq_ignore_ascii_case("VRFY") {
            Ok(Self::Vrfy(required_arg(args)?))
        } else if verb.eq_ignore_ascii_case("EXPN") {
            Ok(Self::Expn(required_arg(args)?))
        } else if verb.eq_ignore_ascii_case("HELP") {
            Ok(Self::Help(optional_arg(args)))
        } else if verb.eq_ignore_ascii_case("NOOP") {
            Ok(Self::Noop(optional_arg(args)))
        } else if verb.eq_ignore_ascii_case("AUTH") {
            let mut fields = args.split_whitespace();
            let sasl_mech = match fields.next() {
                Some(mech) => mech.to_ascii_uppercase(),
                None => return syntax("SASL mechanism is required"),
            };
            let initial_response = fields.next().map(|s| s.to_string());
            if fields.next().is_some() {
                return syntax("too many parameters for AUTH");
            }
            Ok(Self::Auth {
                sasl_mech,
                initial_response,
            })
        } else {
            Err(ParseError::UnknownCommand(verb.to_string()))
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Self::Helo(domain) => format!("HELO {domain}\r\n"),
            Self::Lhlo(domain) => format!("LHLO {domain}\r\n"),
            Self::MailFrom {
                address,
                parameters,
            } => format!("MAIL FROM:<{address}>{}\r\n", format_parameters(parameters)),
            Self::RcptTo {
                address,
                parameters,
            } => format!("RCPT TO:<{address}>{}\r\n", format_parameters(parameters)),
            Self::Data => "DATA\r\n".to_string(),
            Self::DataDot => ".\r\n".to_string(),
            Self::Rset => "RSET\r\n".to_string(),
            Self::Quit => "QUIT\r\n".to_string(),
            Self::StartTls => "STARTTLS\r\n".to_string(),
            Self::Vrfy(param) => format!("VRFY {param}\r\n"),
            Self::Expn(param) => format!("EXPN {param}\r\n"),
            Self::Help(Some(param)) => format!("HELP {param}\r\n"),
            Self::Help(None) => "HELP\r\n".to_string(),
            Self::Noop(Some(param)) => format!("NOOP {param}\r\n"),
            Self::Noop(None) => "NOOP\r\n".to_string(),
            Self::Auth {
                sasl_mech,
                initial_response: None,
            } => format!("AUTH {sasl_mech}\r\n"),
            Self::Auth {
                sasl_mech,
                initial_response: Some(resp),
            } => format!("AUTH {sasl_mech} {resp}\r\n"),
        }
    }

    /// Timeouts for reading the response
    pub fn client_timeout(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        match self {
            Self::Helo(_) | Self::Ehlo(_) | Self::Lhlo(_) => timeouts.ehlo_timeout,
            Self::MailFrom { .. } => timeouts.mail_from_timeout,
            Self::RcptTo { .. } => timeouts.rcpt_to_timeout,
            Self::Data => timeouts.data_timeout,
            Self::DataDot => timeouts.data_dot_timeout,
            Self::Rset => timeouts.rset_timeout,
            Self::StartTls => timeouts.starttls_timeout,
            Self::Quit | Self::Vrfy(_) | Self::Expn(_) | Self::Help(_) | Self::Noop(_) => {
                timeouts.idle_timeout
            }
            Self::Auth { .. } => timeouts.auth_timeout,
        }
    }

    /// Timeouts for writing the request
    pub fn client_timeout_request(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        let one_minute = Duration::from_secs(60);
        self.client_timeout(timeouts).min(one_minute)
    }
}
