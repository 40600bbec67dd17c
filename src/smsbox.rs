// ABOUTME: Request dispatcher: turns routed MO messages into service invocations and replies
// ABOUTME: One worker task per in-flight request; text/file/exec run here, HTTP via an executor

use crate::msg::{Coding, Msg, Sms, SmsType};
use crate::queue::Counter;
use crate::urltrans::{ServiceInvocation, Translation, TranslationTable, invoke};
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Maximum characters per single SMS part for text payloads.
const SMS_PART_CHARS: usize = 160;
/// And for 8-bit payloads or parts carrying a concatenation header.
const SMS_PART_OCTETS: usize = 140;

const EMPTY_REPLY_TEXT: &str = "<Empty reply from service provider>";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("service invocation kind not supported by this executor")]
    Unsupported,
    #[error("service request failed: {0}")]
    Failed(String),
}

/// Performs GET/POST service invocations. The HTTP frontend supplies
/// the real implementation; the core only needs the reply text.
pub trait ServiceExecutor: Send + Sync + 'static {
    fn fetch(
        &self,
        invocation: &ServiceInvocation,
    ) -> impl Future<Output = Result<String, ExecutorError>> + Send;
}

/// Executor for deployments without an HTTP frontend: every HTTP-kind
/// invocation fails, which surfaces in the log rather than silently.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullExecutor;

impl ServiceExecutor for NullExecutor {
    async fn fetch(&self, _invocation: &ServiceInvocation) -> Result<String, ExecutorError> {
        Err(ExecutorError::Unsupported)
    }
}

/// Split reply text into transmittable parts.
///
/// Parts are cut at the last allowed split character within the limit
/// when one is configured; `split_suffix` is appended to every part but
/// the last and its length counts against the limit.
pub fn split_text(
    text: &str,
    max_part: usize,
    split_chars: Option<&str>,
    split_suffix: Option<&str>,
    max_messages: usize,
) -> Vec<String> {
    let suffix = split_suffix.unwrap_or("");
    let mut parts = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut pos = 0;

    while pos < chars.len() && parts.len() < max_messages {
        let last_part = chars.len() - pos <= max_part;
        let budget = if last_part {
            max_part
        } else {
            max_part.saturating_sub(suffix.chars().count()).max(1)
        };
        let mut end = (pos + budget).min(chars.len());

        if end < chars.len() {
            if let Some(split_chars) = split_chars {
                // cut at the last split character inside the budget
                if let Some(cut) = (pos..end)
                    .rev()
                    .find(|&i| split_chars.contains(chars[i]))
                {
                    if cut > pos {
                        end = cut + 1;
                    }
                }
            }
        }

        let mut part: String = chars[pos..end].iter().collect();
        if end < chars.len() {
            part.push_str(suffix);
        }
        parts.push(part);
        pos = end;
    }
    if pos < chars.len() {
        warn!("reply truncated to {max_messages} messages");
    }
    parts
}

/// Concatenation UDH for part `seq` of `total`, 8-bit reference.
fn concat_udh(msg_ref: u8, total: u8, seq: u8) -> Bytes {
    Bytes::from(vec![0x05, 0x00, 0x03, msg_ref, total, seq])
}

/// Cut the reply to the text between `prefix` and `suffix`, used to
/// lift the interesting part out of an HTML page. Both markers must be
/// configured and present, otherwise the reply passes unchanged.
fn cut_prefix_suffix(reply: &str, prefix: Option<&str>, suffix: Option<&str>) -> String {
    let (Some(prefix), Some(suffix)) = (prefix, suffix) else {
        return reply.to_string();
    };
    let Some(start) = reply.find(prefix) else {
        return reply.to_string();
    };
    let body = &reply[start + prefix.len()..];
    match body.find(suffix) {
        Some(end) => body[..end].to_string(),
        None => reply.to_string(),
    }
}

/// Build the reply messages for a serviced request: header/footer,
/// sender swap, faked sender and splitting per the translation.
pub fn build_reply(
    t: &Translation,
    request: &Sms,
    reply_text: &str,
    concat_ref: &Counter,
) -> Vec<Msg> {
    let mut text = String::new();
    if let Some(header) = &t.header {
        text.push_str(header);
    }
    if reply_text.is_empty() {
        if t.omit_empty {
            return Vec::new();
        }
        text.push_str(EMPTY_REPLY_TEXT);
    } else {
        text.push_str(reply_text);
    }
    if let Some(footer) = &t.footer {
        text.push_str(footer);
    }

    let max_messages = t.max_messages.max(0) as usize;
    if max_messages == 0 {
        return Vec::new();
    }

    let max_part = if t.concatenation {
        // room for the concatenation header
        SMS_PART_OCTETS - 6
    } else {
        SMS_PART_CHARS
    };
    let parts = split_text(
        &text,
        max_part,
        t.split_chars.as_deref(),
        t.split_suffix.as_deref(),
        max_messages,
    );
    let total = parts.len();
    let msg_ref = (concat_ref.increase() & 0xFF) as u8;

    parts
        .into_iter()
        .enumerate()
        .map(|(i, part)| {
            let mut reply = Sms::new();
            reply.sender = t
                .faked_sender
                .clone()
                .or_else(|| request.receiver.clone());
            reply.receiver = request.sender.clone();
            reply.msgdata = Some(Bytes::from(part.into_bytes()));
            reply.coding = Coding::SevenBit;
            reply.sms_type = SmsType::MtReply;
            reply.service = Some(t.name.clone());
            reply.smsc_id = request.smsc_id.clone();
            reply.boxc_id = request.boxc_id.clone();
            reply.time = request.time;
            if t.concatenation && total > 1 {
                reply.udhdata = Some(concat_udh(msg_ref, total as u8, (i + 1) as u8));
                reply.coding = Coding::SevenBit;
            }
            Msg::Sms(reply)
        })
        .collect()
}

/// Resolve one invocation to its reply text.
async fn run_invocation<E: ServiceExecutor>(
    executor: &E,
    invocation: &ServiceInvocation,
) -> Result<String, ExecutorError> {
    match invocation {
        ServiceInvocation::Text(text) => Ok(text.clone()),
        ServiceInvocation::File(path) => tokio::fs::read_to_string(path)
            .await
            .map(|s| s.trim_end_matches('\n').to_string())
            .map_err(|e| ExecutorError::Failed(format!("cannot read {path}: {e}"))),
        ServiceInvocation::Execute(cmd) => {
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .output()
                .await
                .map_err(|e| ExecutorError::Failed(format!("cannot execute: {e}")))?;
            Ok(String::from_utf8_lossy(&output.stdout)
                .trim_end_matches('\n')
                .to_string())
        }
        http @ (ServiceInvocation::GetUrl(_)
        | ServiceInvocation::PostUrl { .. }
        | ServiceInvocation::PostXml { .. }) => executor.fetch(http).await,
    }
}

/// Service one MO (or report) message: select the translation, run the
/// invocation, build replies. Reports produce no reply messages.
pub async fn handle_request<E: ServiceExecutor>(
    table: &TranslationTable,
    executor: &E,
    concat_ref: &Counter,
    mut sms: Sms,
) -> Vec<Msg> {
    let text = sms
        .msgdata
        .as_ref()
        .map(|d| String::from_utf8_lossy(d).into_owned())
        .unwrap_or_default();
    let sender = sms.sender.clone().unwrap_or_default();
    let receiver = sms.receiver.clone().unwrap_or_default();

    if !sender.is_empty() && sender == receiver {
        warn!("ignoring message from <{sender}> to itself");
        return Vec::new();
    }

    let translation = if sms.sms_type == SmsType::Report {
        table.find_service(&sms)
    } else {
        table.find(&text, sms.smsc_id.as_deref(), &sender, &receiver)
    };
    let Some(t) = translation else {
        info!("no service found for <{text}> from <{sender}>");
        return Vec::new();
    };
    sms.service = Some(t.name.clone());

    let Some(invocation) = invoke(t, &mut sms) else {
        return Vec::new();
    };
    if sms.sms_type == SmsType::Report {
        // report URLs fire and forget, the reply body is not resent
        match &invocation {
            ServiceInvocation::GetUrl(url) if url.is_empty() => {}
            _ => {
                if let Err(e) = run_invocation(executor, &invocation).await {
                    error!("delivery report callback failed: {e}");
                }
            }
        }
        return Vec::new();
    }

    debug!("servicing <{text}> via <{}>", t.name);
    match run_invocation(executor, &invocation).await {
        Ok(reply) => {
            let reply = if t.trans_type == crate::urltrans::TransType::GetUrl {
                cut_prefix_suffix(&reply, t.prefix.as_deref(), t.suffix.as_deref())
            } else {
                reply
            };
            build_reply(t, &sms, &reply, concat_ref)
        }
        Err(e) => {
            error!("service <{}> failed: {e}", t.name);
            Vec::new()
        }
    }
}

/// Per-message worker dispatch: each routed message gets its own task,
/// replies flow into `reply_tx` for MT routing.
pub struct Dispatcher<E> {
    table: Arc<TranslationTable>,
    executor: Arc<E>,
    concat_ref: Arc<Counter>,
    reply_tx: mpsc::UnboundedSender<Msg>,
}

impl<E: ServiceExecutor> Dispatcher<E> {
    pub fn new(
        table: Arc<TranslationTable>,
        executor: Arc<E>,
        reply_tx: mpsc::UnboundedSender<Msg>,
    ) -> Self {
        Dispatcher {
            table,
            executor,
            concat_ref: Arc::new(Counter::new()),
            reply_tx,
        }
    }

    pub fn table(&self) -> &TranslationTable {
        &self.table
    }

    /// Spawn a worker for one message. Non-SMS messages are dropped
    /// here; datagrams belong to the WAP side.
    pub fn dispatch(&self, msg: Msg) {
        let sms = match msg {
            Msg::Sms(sms) => sms,
            other => {
                debug!("dispatcher ignoring {} message", other.type_name());
                return;
            }
        };
        let table = self.table.clone();
        let executor = self.executor.clone();
        let concat_ref = self.concat_ref.clone();
        let reply_tx = self.reply_tx.clone();
        tokio::spawn(async move {
            for reply in handle_request(&table, &*executor, &concat_ref, sms).await {
                let _ = reply_tx.send(reply);
            }
        });
    }
}
