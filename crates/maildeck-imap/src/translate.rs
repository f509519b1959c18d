//! Translation between the wire client's protocol types and the shared
//! models posted on the bus.

use std::borrow::Cow;

use async_imap::imap_proto::types as proto;
use async_imap::types::Flag;
use chrono::{DateTime, Utc};
use maildeck_worker::models::{Address, BodyStructure, Envelope, Flags, Role, Uid};

pub(crate) fn decode(bytes: Option<&Cow<'_, [u8]>>) -> String {
    bytes
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default()
}

pub(crate) fn envelope(env: &proto::Envelope<'_>) -> Envelope {
    Envelope {
        date: parse_date(&decode(env.date.as_ref())),
        subject: decode(env.subject.as_ref()),
        from: addresses(env.from.as_deref()),
        reply_to: addresses(env.reply_to.as_deref()),
        to: addresses(env.to.as_deref()),
        cc: addresses(env.cc.as_deref()),
        bcc: addresses(env.bcc.as_deref()),
        message_id: decode(env.message_id.as_ref()),
        in_reply_to: decode(env.in_reply_to.as_ref()),
    }
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    let epoch = mailparse::dateparse(raw).ok()?;
    DateTime::from_timestamp(epoch, 0)
}

fn addresses(addrs: Option<&[proto::Address<'_>]>) -> Vec<Address> {
    addrs
        .unwrap_or_default()
        .iter()
        .map(|addr| {
            let name = addr
                .name
                .as_ref()
                .map(|n| String::from_utf8_lossy(n).into_owned());
            Address::new(
                name,
                &decode(addr.mailbox.as_ref()),
                &decode(addr.host.as_ref()),
            )
        })
        .collect()
}

pub(crate) fn body_structure(bs: &proto::BodyStructure<'_>) -> BodyStructure {
    match bs {
        proto::BodyStructure::Basic { common, other, .. } => {
            single_part(common, other, Vec::new())
        }
        proto::BodyStructure::Text { common, other, .. } => {
            single_part(common, other, Vec::new())
        }
        proto::BodyStructure::Message {
            common, other, body, ..
        } => single_part(common, other, vec![body_structure(body)]),
        proto::BodyStructure::Multipart { common, bodies, .. } => BodyStructure {
            mime_type: "multipart".into(),
            mime_subtype: common.ty.subtype.to_string().to_ascii_lowercase(),
            params: body_params(common.ty.params.as_deref()),
            parts: bodies.iter().map(body_structure).collect(),
            disposition: disposition(common.disposition.as_ref()),
            disposition_params: disposition_params(common.disposition.as_ref()),
            ..BodyStructure::default()
        },
    }
}

fn single_part(
    common: &proto::BodyContentCommon<'_>,
    other: &proto::BodyContentSinglePart<'_>,
    parts: Vec<BodyStructure>,
) -> BodyStructure {
    BodyStructure {
        mime_type: common.ty.ty.to_string().to_ascii_lowercase(),
        mime_subtype: common.ty.subtype.to_string().to_ascii_lowercase(),
        params: body_params(common.ty.params.as_deref()),
        description: other.description.as_ref().map(|d| d.to_string()),
        encoding: Some(encoding(&other.transfer_encoding)),
        parts,
        disposition: disposition(common.disposition.as_ref()),
        disposition_params: disposition_params(common.disposition.as_ref()),
    }
}

fn body_params(params: Option<&[(Cow<'_, str>, Cow<'_, str>)]>) -> Vec<(String, String)> {
    params
        .unwrap_or_default()
        .iter()
        .map(|(k, v)| (k.to_string().to_ascii_lowercase(), v.to_string()))
        .collect()
}

fn disposition(disposition: Option<&proto::ContentDisposition<'_>>) -> Option<String> {
    disposition.map(|d| d.ty.to_string().to_ascii_lowercase())
}

fn disposition_params(
    disposition: Option<&proto::ContentDisposition<'_>>,
) -> Vec<(String, String)> {
    disposition
        .map(|d| body_params(d.params.as_deref()))
        .unwrap_or_default()
}

fn encoding(enc: &proto::ContentEncoding<'_>) -> String {
    match enc {
        proto::ContentEncoding::SevenBit => "7bit".into(),
        proto::ContentEncoding::EightBit => "8bit".into(),
        proto::ContentEncoding::Binary => "binary".into(),
        proto::ContentEncoding::Base64 => "base64".into(),
        proto::ContentEncoding::QuotedPrintable => "quoted-printable".into(),
        proto::ContentEncoding::Other(other) => other.to_string().to_ascii_lowercase(),
    }
}

pub(crate) fn flags<'a>(iter: impl Iterator<Item = Flag<'a>>) -> Flags {
    let mut flags = Flags::empty();
    for flag in iter {
        flags |= match flag {
            Flag::Seen => Flags::SEEN,
            Flag::Answered => Flags::ANSWERED,
            Flag::Flagged => Flags::FLAGGED,
            Flag::Deleted => Flags::DELETED,
            Flag::Draft => Flags::DRAFT,
            Flag::Recent => Flags::RECENT,
            _ => Flags::empty(),
        };
    }
    flags
}

pub(crate) fn flags_from_strs<'a>(iter: impl Iterator<Item = &'a str>) -> Flags {
    let mut flags = Flags::empty();
    for raw in iter {
        flags |= match raw.to_ascii_lowercase().as_str() {
            "\\seen" => Flags::SEEN,
            "\\answered" => Flags::ANSWERED,
            "\\flagged" => Flags::FLAGGED,
            "\\deleted" => Flags::DELETED,
            "\\draft" => Flags::DRAFT,
            "\\recent" => Flags::RECENT,
            _ => Flags::empty(),
        };
    }
    flags
}

/// Renders flags as the parenthesized list STORE and APPEND expect.
pub(crate) fn flag_list(flags: Flags) -> String {
    let mut names = Vec::new();
    for (flag, name) in [
        (Flags::SEEN, "\\Seen"),
        (Flags::ANSWERED, "\\Answered"),
        (Flags::FLAGGED, "\\Flagged"),
        (Flags::DELETED, "\\Deleted"),
        (Flags::DRAFT, "\\Draft"),
    ] {
        if flags.contains(flag) {
            names.push(name);
        }
    }
    format!("({})", names.join(" "))
}

/// Maps a special-use mailbox attribute to a role.
pub(crate) fn role_from_attribute(attr: &str) -> Option<Role> {
    match attr.trim_start_matches('\\').to_ascii_lowercase().as_str() {
        "inbox" => Some(Role::Inbox),
        "archive" | "all" => Some(Role::Archive),
        "drafts" => Some(Role::Drafts),
        "junk" => Some(Role::Junk),
        "sent" => Some(Role::Sent),
        "trash" => Some(Role::Trash),
        _ => None,
    }
}

/// Renders a UID list as an IMAP sequence set.
pub(crate) fn uid_set(uids: &[Uid]) -> String {
    uids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Extracts the message-id list from the References header of a raw header
/// block, for threading.
pub(crate) fn references(header: &[u8]) -> Vec<String> {
    let Ok((headers, _)) = mailparse::parse_headers(header) else {
        return Vec::new();
    };
    use mailparse::MailHeaderMap;
    headers
        .get_all_values("References")
        .iter()
        .flat_map(|value| value.split_whitespace())
        .map(|id| id.trim_matches(['<', '>']).to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn uid_set_renders_comma_separated() {
        assert_eq!(uid_set(&[1, 2, 30]), "1,2,30");
        assert_eq!(uid_set(&[]), "");
    }

    #[test]
    fn flag_list_renders_parenthesized() {
        assert_eq!(flag_list(Flags::SEEN | Flags::FLAGGED), "(\\Seen \\Flagged)");
        assert_eq!(flag_list(Flags::empty()), "()");
    }

    #[test]
    fn flags_from_strings() {
        let flags = flags_from_strs(["\\Seen", "\\Deleted", "$Forwarded"].into_iter());
        assert_eq!(flags, Flags::SEEN | Flags::DELETED);
    }

    #[test]
    fn roles_from_attributes() {
        assert_eq!(role_from_attribute("\\Sent"), Some(Role::Sent));
        assert_eq!(role_from_attribute("\\Trash"), Some(Role::Trash));
        assert_eq!(role_from_attribute("\\Noselect"), None);
    }

    #[test]
    fn references_split_and_stripped() {
        let header = b"Subject: hi\r\nReferences: <a@x> <b@y>\r\n\t<c@z>\r\n\r\n";
        assert_eq!(references(header), ["a@x", "b@y", "c@z"]);
    }

    #[test]
    fn references_missing_header() {
        assert!(references(b"Subject: hi\r\n\r\n").is_empty());
    }

    #[test]
    fn date_parsing() {
        let date = parse_date("Fri, 21 Nov 1997 09:55:06 -0600");
        assert!(date.is_some());
        assert!(parse_date("").is_none());
        assert!(parse_date("not a date").is_none());
    }
}
