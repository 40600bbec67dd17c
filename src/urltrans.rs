// ABOUTME: SMS service routing: keyword translations, selection filters and pattern expansion
// ABOUTME: Maps an inbound short message to the service invocation that answers it

use crate::cfg::{Cfg, CfgError, CfgGroup};
use crate::charset::url_encode;
use crate::msg::{Coding, PARAM_UNDEFINED, Sms, SmsType};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::warn;

/// What kind of service a translation invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransType {
    GetUrl,
    PostUrl,
    PostXml,
    File,
    Text,
    Execute,
    SendSms,
}

#[derive(Debug, Error)]
pub enum TransError {
    #[error(transparent)]
    Cfg(#[from] CfgError),
    #[error("sms-service group needs one of get-url, post-url, post-xml, file, text or exec")]
    NoPattern,
    #[error("sms-service group must include 'keyword'")]
    NoKeyword,
    #[error("sendsms-user group must include 'username' and 'password'")]
    NoCredentials,
}

/// One routing entry, read-only after configuration load.
#[derive(Debug)]
pub struct Translation {
    pub keyword: Option<String>,
    pub aliases: Vec<String>,
    pub trans_type: TransType,
    pub pattern: String,
    pub name: String,
    pub dlr_url: Option<String>,
    pub accepted_smsc: Option<Vec<String>>,
    pub allowed_prefix: Option<String>,
    pub denied_prefix: Option<String>,
    pub allowed_recv_prefix: Option<String>,
    pub denied_recv_prefix: Option<String>,
    pub white_list: Option<HashSet<String>>,
    pub black_list: Option<HashSet<String>>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub faked_sender: Option<String>,
    pub default_sender: Option<String>,
    pub max_messages: i64,
    pub concatenation: bool,
    pub split_chars: Option<String>,
    pub split_suffix: Option<String>,
    pub omit_empty: bool,
    pub header: Option<String>,
    pub footer: Option<String>,
    pub strip_keyword: bool,
    pub catch_all: bool,
    pub args: usize,
    pub has_catchall_arg: bool,
    // sendsms-user side
    pub username: Option<String>,
    pub password: Option<String>,
    pub forced_smsc: Option<String>,
    pub default_smsc: Option<String>,
    pub allow_ip: Option<String>,
    pub deny_ip: Option<String>,
}

const SMS_SERVICE_KEYS: &[&str] = &[
    "keyword",
    "aliases",
    "name",
    "get-url",
    "url",
    "post-url",
    "post-xml",
    "file",
    "text",
    "exec",
    "dlr-url",
    "accepted-smsc",
    "allowed-prefix",
    "denied-prefix",
    "allowed-receiver-prefix",
    "denied-receiver-prefix",
    "white-list",
    "black-list",
    "catch-all",
    "prefix",
    "suffix",
    "faked-sender",
    "max-messages",
    "concatenation",
    "split-chars",
    "split-suffix",
    "omit-empty",
    "header",
    "footer",
    "strip-keyword",
];

const SENDSMS_USER_KEYS: &[&str] = &[
    "username",
    "password",
    "name",
    "dlr-url",
    "forced-smsc",
    "default-smsc",
    "default-sender",
    "faked-sender",
    "user-allow-ip",
    "user-deny-ip",
    "allowed-prefix",
    "denied-prefix",
    "white-list",
    "black-list",
    "max-messages",
    "concatenation",
    "split-chars",
    "split-suffix",
    "omit-empty",
    "header",
    "footer",
];

fn count_occurrences(text: &str, pattern: &str) -> usize {
    text.matches(pattern).count()
}

fn number_set(value: &str) -> HashSet<String> {
    value
        .split([';', ','])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Translation {
    fn from_sms_service(grp: &CfgGroup) -> Result<Self, TransError> {
        grp.check_allowed(SMS_SERVICE_KEYS);

        let (trans_type, pattern, mut catch_all) = if let Some(url) =
            grp.get_string("get-url").or_else(|| grp.get_string("url"))
        {
            (TransType::GetUrl, url, false)
        } else if let Some(url) = grp.get_string("post-url") {
            // POST bodies carry the whole text, arg counting is moot
            (TransType::PostUrl, url, true)
        } else if let Some(url) = grp.get_string("post-xml") {
            (TransType::PostXml, url, true)
        } else if let Some(file) = grp.get_string("file") {
            (TransType::File, file, false)
        } else if let Some(text) = grp.get_string("text") {
            (TransType::Text, text, false)
        } else if let Some(cmd) = grp.get_string("exec") {
            (TransType::Execute, cmd, false)
        } else {
            return Err(TransError::NoPattern);
        };
        if let Some(flag) = grp.get_bool("catch-all")? {
            catch_all = catch_all || flag;
        }

        let keyword = grp
            .get_string("keyword")
            .ok_or(TransError::NoKeyword)?
            .to_lowercase();
        let name = grp.get_string("name").unwrap_or_else(|| keyword.clone());
        let aliases = grp
            .get("aliases")
            .map(|a| {
                a.split(';')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let args = count_occurrences(&pattern, "%s") + count_occurrences(&pattern, "%S");
        let has_catchall_arg =
            count_occurrences(&pattern, "%r") > 0 || count_occurrences(&pattern, "%a") > 0;

        let prefix = grp.get_string("prefix");
        let suffix = grp.get_string("suffix");
        if prefix.is_some() != suffix.is_some() {
            warn!(
                "service <{keyword}>: suffix and prefix are only used if both are set"
            );
        }
        if (prefix.is_some() || suffix.is_some()) && trans_type != TransType::GetUrl {
            warn!(
                "service <{keyword}>: suffix and prefix are only used if type is 'get-url'"
            );
        }

        Ok(Translation {
            keyword: Some(keyword),
            aliases,
            trans_type,
            pattern,
            name,
            dlr_url: grp.get_string("dlr-url"),
            accepted_smsc: grp.get("accepted-smsc").map(|v| {
                v.split(';')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }),
            allowed_prefix: grp.get_string("allowed-prefix"),
            denied_prefix: grp.get_string("denied-prefix"),
            allowed_recv_prefix: grp.get_string("allowed-receiver-prefix"),
            denied_recv_prefix: grp.get_string("denied-receiver-prefix"),
            white_list: grp.get("white-list").map(number_set),
            black_list: grp.get("black-list").map(number_set),
            prefix,
            suffix,
            faked_sender: grp.get_string("faked-sender"),
            default_sender: None,
            max_messages: grp.get_integer("max-messages")?.unwrap_or(1),
            concatenation: grp.get_bool("concatenation")?.unwrap_or(false),
            split_chars: grp.get_string("split-chars"),
            split_suffix: grp.get_string("split-suffix"),
            omit_empty: grp.get_bool("omit-empty")?.unwrap_or(false),
            header: grp.get_string("header"),
            footer: grp.get_string("footer"),
            strip_keyword: grp.get_bool("strip-keyword")?.unwrap_or(false),
            catch_all,
            args,
            has_catchall_arg,
            username: None,
            password: None,
            forced_smsc: None,
            default_smsc: None,
            allow_ip: None,
            deny_ip: None,
        })
    }

    fn from_sendsms_user(grp: &CfgGroup) -> Result<Self, TransError> {
        grp.check_allowed(SENDSMS_USER_KEYS);

        let username = grp.get_string("username").ok_or(TransError::NoCredentials)?;
        let password = grp.get_string("password").ok_or(TransError::NoCredentials)?;
        let name = grp.get_string("name").unwrap_or_else(|| username.clone());

        let forced_smsc = grp.get_string("forced-smsc");
        let default_smsc = grp.get_string("default-smsc");
        if forced_smsc.is_some() && default_smsc.is_some() {
            warn!("redundant default-smsc for send-sms user {username}");
        }

        Ok(Translation {
            keyword: None,
            aliases: Vec::new(),
            trans_type: TransType::SendSms,
            pattern: String::new(),
            name,
            dlr_url: grp.get_string("dlr-url"),
            accepted_smsc: None,
            allowed_prefix: grp.get_string("allowed-prefix"),
            denied_prefix: grp.get_string("denied-prefix"),
            allowed_recv_prefix: None,
            denied_recv_prefix: None,
            white_list: grp.get("white-list").map(number_set),
            black_list: grp.get("black-list").map(number_set),
            prefix: None,
            suffix: None,
            faked_sender: grp.get_string("faked-sender"),
            default_sender: grp.get_string("default-sender"),
            max_messages: grp.get_integer("max-messages")?.unwrap_or(1),
            concatenation: grp.get_bool("concatenation")?.unwrap_or(false),
            split_chars: grp.get_string("split-chars"),
            split_suffix: grp.get_string("split-suffix"),
            omit_empty: grp.get_bool("omit-empty")?.unwrap_or(false),
            header: grp.get_string("header"),
            footer: grp.get_string("footer"),
            strip_keyword: false,
            catch_all: true,
            args: 0,
            has_catchall_arg: false,
            username: Some(username),
            password: Some(password),
            forced_smsc,
            default_smsc,
            allow_ip: grp.get_string("user-allow-ip"),
            deny_ip: grp.get_string("user-deny-ip"),
        })
    }

    /// Apply the per-candidate filters of the selection algorithm.
    /// `reject` is raised when a white/black list was the reason.
    fn filters_pass(
        &self,
        smsc: Option<&str>,
        sender: &str,
        receiver: &str,
        reject: &mut bool,
    ) -> bool {
        use crate::smscconn::does_prefix_match;

        if let (Some(accepted), Some(smsc)) = (&self.accepted_smsc, smsc) {
            if !accepted.iter().any(|a| a == smsc) {
                return false;
            }
        }

        if let (Some(allowed), None) = (&self.allowed_prefix, &self.denied_prefix) {
            if !does_prefix_match(allowed, sender) {
                return false;
            }
        }
        if let (Some(denied), None) = (&self.denied_prefix, &self.allowed_prefix) {
            if does_prefix_match(denied, sender) {
                return false;
            }
        }

        if let (Some(allowed), None) = (&self.allowed_recv_prefix, &self.denied_recv_prefix) {
            if !does_prefix_match(allowed, receiver) {
                return false;
            }
        }
        if let (Some(denied), None) = (&self.denied_recv_prefix, &self.allowed_recv_prefix) {
            if does_prefix_match(denied, receiver) {
                return false;
            }
        }

        if let Some(white) = &self.white_list {
            if !white.contains(sender) {
                *reject = true;
                return false;
            }
        }
        if let Some(black) = &self.black_list {
            if black.contains(sender) {
                *reject = true;
                return false;
            }
        }

        if let (Some(allowed), Some(denied)) = (&self.allowed_prefix, &self.denied_prefix) {
            if !does_prefix_match(allowed, sender) && does_prefix_match(denied, sender) {
                return false;
            }
        }

        true
    }
}

/// All translations plus the keyword and name indexes.
#[derive(Debug, Default)]
pub struct TranslationTable {
    list: Vec<Translation>,
    by_keyword: HashMap<String, Vec<usize>>,
    by_name: HashMap<String, usize>,
}

impl TranslationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `sms-service` and `sendsms-user` group.
    pub fn from_cfg(cfg: &Cfg) -> Result<Self, TransError> {
        let mut table = TranslationTable::new();
        for grp in cfg.groups("sms-service") {
            table.add(Translation::from_sms_service(grp)?);
        }
        for grp in cfg.groups("sendsms-user") {
            table.add(Translation::from_sendsms_user(grp)?);
        }
        Ok(table)
    }

    pub fn add(&mut self, t: Translation) {
        let idx = self.list.len();
        if let Some(keyword) = &t.keyword {
            self.by_keyword.entry(keyword.clone()).or_default().push(idx);
            for alias in &t.aliases {
                self.by_keyword.entry(alias.clone()).or_default().push(idx);
            }
        }
        let name_key = t
            .username
            .clone()
            .unwrap_or_else(|| t.name.to_lowercase());
        self.by_name.entry(name_key).or_insert(idx);
        self.list.push(t);
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    fn candidates(&self, keyword: &str) -> impl Iterator<Item = &Translation> {
        self.by_keyword
            .get(keyword)
            .into_iter()
            .flatten()
            .map(|&idx| &self.list[idx])
    }

    fn find_with_keyword(
        &self,
        keyword: &str,
        nwords: usize,
        smsc: Option<&str>,
        sender: &str,
        receiver: &str,
        reject: &mut bool,
    ) -> Option<&Translation> {
        for t in self.candidates(keyword) {
            if !t.filters_pass(smsc, sender, receiver, reject) {
                continue;
            }
            if t.catch_all {
                *reject = false;
                return Some(t);
            }
            if nwords - 1 == t.args {
                *reject = false;
                return Some(t);
            }
            if t.has_catchall_arg && nwords - 1 >= t.args {
                *reject = false;
                return Some(t);
            }
        }
        None
    }

    /// The `default` entry ignores the argument-count policy: any
    /// candidate passing the filters takes the message.
    fn find_default(
        &self,
        smsc: Option<&str>,
        sender: &str,
        receiver: &str,
        reject: &mut bool,
    ) -> Option<&Translation> {
        for t in self.candidates("default") {
            if t.filters_pass(smsc, sender, receiver, reject) {
                *reject = false;
                return Some(t);
            }
        }
        None
    }

    fn find_black_list(&self, smsc: Option<&str>) -> Option<&Translation> {
        self.candidates("black-list").find(|t| {
            match (&t.accepted_smsc, smsc) {
                (Some(accepted), Some(smsc)) => accepted.iter().any(|a| a == smsc),
                _ => true,
            }
        })
    }

    /// Select the translation for an inbound message text.
    ///
    /// The first word is the keyword; if no candidate matches, the
    /// reserved keyword `default` is retried. A candidate rejected by a
    /// white/black list selects the reserved `black-list` entry
    /// instead of failing silently.
    pub fn find(
        &self,
        text: &str,
        smsc: Option<&str>,
        sender: &str,
        receiver: &str,
    ) -> Option<&Translation> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let mut reject = false;

        let mut found = match words.first() {
            Some(first) => self.find_with_keyword(
                &first.to_lowercase(),
                words.len(),
                smsc,
                sender,
                receiver,
                &mut reject,
            ),
            None => None,
        };
        if reject {
            return self.find_black_list(smsc);
        }
        if found.is_none() {
            found = self.find_default(smsc, sender, receiver, &mut reject);
            if reject {
                return self.find_black_list(smsc);
            }
        }
        found
    }

    /// Route by service name, used for delivery reports which carry the
    /// service that produced the original message.
    pub fn find_service(&self, msg: &Sms) -> Option<&Translation> {
        let service = msg.service.as_deref()?;
        self.by_name
            .get(&service.to_lowercase())
            .map(|&idx| &self.list[idx])
    }

    /// Look up a sendsms account by username.
    pub fn find_username(&self, username: &str) -> Option<&Translation> {
        self.list
            .iter()
            .find(|t| t.trans_type == TransType::SendSms && t.username.as_deref() == Some(username))
    }

    /// Authenticate a sendsms request: username, password and client IP
    /// must all be acceptable.
    pub fn authorize_sendsms(
        &self,
        username: &str,
        password: &str,
        client_ip: &str,
    ) -> Option<&Translation> {
        let t = self.find_username(username)?;
        if t.password.as_deref() != Some(password) {
            return None;
        }
        if !crate::boxc::ip_allowed(t.allow_ip.as_deref(), t.deny_ip.as_deref(), client_ip) {
            return None;
        }
        Some(t)
    }
}

/// Remove the first word and the whitespace run after it.
fn strip_keyword(sms: &mut Sms) {
    let Some(data) = &sms.msgdata else { return };
    let text = String::from_utf8_lossy(data);
    let trimmed = match text.find(char::is_whitespace) {
        Some(pos) => text[pos..].trim_start().to_string(),
        None => String::new(),
    };
    sms.msgdata = Some(trimmed.into_bytes().into());
}

/// Days-to-civil conversion for %t, proleptic Gregorian, UTC.
fn gmtime(secs: i64) -> (i32, u32, u32, u32, u32, u32) {
    let days = secs.div_euclid(86_400);
    let rem = secs.rem_euclid(86_400);
    let (hh, mm, ss) = (
        (rem / 3600) as u32,
        ((rem % 3600) / 60) as u32,
        (rem % 60) as u32,
    );
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = (if m <= 2 { y + 1 } else { y }) as i32;
    (year, m, d, hh, mm, ss)
}

/// Expand a translation pattern for a message.
///
/// For delivery reports the pattern comes from the message's own
/// dlr_url if set, else the translation's; an empty result means there
/// is nothing to invoke. With `strip-keyword` set on POST types the
/// keyword is removed from the message data afterwards.
pub fn expand_pattern(t: &Translation, sms: &mut Sms) -> String {
    let text = sms
        .msgdata
        .as_ref()
        .map(|d| String::from_utf8_lossy(d).into_owned())
        .unwrap_or_default();
    let words: Vec<&str> = text.split_whitespace().collect();

    let is_report = sms.sms_type == SmsType::Report;
    let pattern: String = if is_report {
        let from_msg = sms.dlr_url.clone().unwrap_or_default();
        if !from_msg.is_empty() {
            from_msg
        } else if let Some(url) = &t.dlr_url {
            url.clone()
        } else {
            return String::new();
        }
    } else {
        t.pattern.clone()
    };

    let mut result = String::with_capacity(pattern.len());
    let mut nextarg = 1usize;
    let bytes: Vec<char> = pattern.chars().collect();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let c = bytes[pos];
        if c != '%' || pos + 1 >= bytes.len() {
            result.push(c);
            pos += 1;
            continue;
        }
        match bytes[pos + 1] {
            'k' => {
                if let Some(word) = words.first() {
                    result.push_str(&url_encode(word.as_bytes()));
                }
            }
            's' => {
                if nextarg < words.len() {
                    result.push_str(&url_encode(words[nextarg].as_bytes()));
                    nextarg += 1;
                }
            }
            'S' => {
                if nextarg < words.len() {
                    for ch in words[nextarg].chars() {
                        result.push(if ch == '*' { '~' } else { ch });
                    }
                    nextarg += 1;
                }
            }
            'r' => {
                for (j, word) in words.iter().enumerate().skip(nextarg) {
                    if j != nextarg {
                        result.push('+');
                    }
                    result.push_str(&url_encode(word.as_bytes()));
                }
            }
            'a' => {
                for (j, word) in words.iter().enumerate() {
                    if j > 0 {
                        result.push('+');
                    }
                    result.push_str(&url_encode(word.as_bytes()));
                }
            }
            'b' => {
                if let Some(data) = &sms.msgdata {
                    result.push_str(&url_encode(data));
                }
            }
            // for reports the sender and receiver are already switched,
            // so %P is the original receiver and vice versa
            'P' => {
                if let Some(sender) = &sms.sender {
                    result.push_str(&url_encode(sender.as_bytes()));
                }
            }
            'p' => {
                if let Some(receiver) = &sms.receiver {
                    result.push_str(&url_encode(receiver.as_bytes()));
                }
            }
            'Q' => {
                if let Some(sender) = &sms.sender {
                    if let Some(rest) = sender.strip_prefix("00") {
                        result.push_str("%2B");
                        result.push_str(&url_encode(rest.as_bytes()));
                    } else {
                        result.push_str(&url_encode(sender.as_bytes()));
                    }
                }
            }
            'q' => {
                if let Some(receiver) = &sms.receiver {
                    if let Some(rest) = receiver.strip_prefix("00") {
                        result.push_str("%2B");
                        result.push_str(&url_encode(rest.as_bytes()));
                    } else {
                        result.push_str(&url_encode(receiver.as_bytes()));
                    }
                }
            }
            't' => {
                let (y, mo, d, h, mi, s) = gmtime(sms.time as i64);
                result.push_str(&format!(
                    "{y:04}-{mo:02}-{d:02}+{h:02}:{mi:02}:{s:02}"
                ));
            }
            'T' => {
                if sms.time != PARAM_UNDEFINED {
                    result.push_str(&sms.time.to_string());
                }
            }
            'i' => {
                if let Some(smsc_id) = &sms.smsc_id {
                    result.push_str(&url_encode(smsc_id.as_bytes()));
                }
            }
            'I' => {
                if sms.id != PARAM_UNDEFINED {
                    result.push_str(&sms.id.to_string());
                }
            }
            'n' => {
                if let Some(service) = &sms.service {
                    result.push_str(&url_encode(service.as_bytes()));
                }
            }
            'd' => {
                result.push_str(&url_encode(sms.dlr_mask.to_string().as_bytes()));
            }
            'A' => {
                if is_report {
                    if let Some(data) = &sms.msgdata {
                        result.push_str(&url_encode(data));
                    }
                }
            }
            'c' => {
                result.push_str(&(sms.coding as i32).to_string());
            }
            'C' => {
                match &sms.charset {
                    Some(charset) if !charset.is_empty() => result.push_str(charset),
                    _ => result.push_str(match sms.coding {
                        Coding::Undef | Coding::SevenBit => "ISO-8859-1",
                        Coding::EightBit => "8-BIT",
                        Coding::Ucs2 => "UTF16-BE",
                    }),
                }
            }
            'u' => {
                if let Some(udh) = &sms.udhdata {
                    if !udh.is_empty() {
                        result.push_str(&url_encode(udh));
                    }
                }
            }
            'B' => {
                if let Some(binfo) = &sms.binfo {
                    if !binfo.is_empty() {
                        result.push_str(&url_encode(binfo.as_bytes()));
                    }
                }
            }
            '%' => result.push('%'),
            other => {
                result.push('%');
                result.push(other);
            }
        }
        pos += 2;
    }

    if t.strip_keyword
        && matches!(t.trans_type, TransType::PostUrl | TransType::PostXml)
    {
        strip_keyword(sms);
    }
    result
}

/// The work a translated message resolves to. GET/POST invocations are
/// executed by the HTTP frontend; the rest the dispatcher can run
/// itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceInvocation {
    GetUrl(String),
    PostUrl { url: String, body: Vec<u8> },
    PostXml { url: String, body: Vec<u8> },
    File(String),
    Text(String),
    Execute(String),
}

/// Resolve a selected translation into its invocation.
pub fn invoke(t: &Translation, sms: &mut Sms) -> Option<ServiceInvocation> {
    let expanded = expand_pattern(t, sms);
    match t.trans_type {
        TransType::GetUrl => Some(ServiceInvocation::GetUrl(expanded)),
        TransType::PostUrl => Some(ServiceInvocation::PostUrl {
            url: expanded,
            body: sms.msgdata.as_ref().map(|d| d.to_vec()).unwrap_or_default(),
        }),
        TransType::PostXml => Some(ServiceInvocation::PostXml {
            url: expanded,
            body: sms.msgdata.as_ref().map(|d| d.to_vec()).unwrap_or_default(),
        }),
        TransType::File => Some(ServiceInvocation::File(expanded)),
        TransType::Text => Some(ServiceInvocation::Text(expanded)),
        TransType::Execute => Some(ServiceInvocation::Execute(expanded)),
        TransType::SendSms => None,
    }
}
