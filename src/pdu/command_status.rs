// ABOUTME: SMPP command_status values as a transparent newtype over the raw code
// ABOUTME: A newtype rather than an enum so vendor-specific codes pass through intact

use std::fmt;

/// SMPP command_status. SMSCs routinely return vendor codes outside the
/// v3.4 table, so the raw value is preserved and well-known codes get
/// named constants and a description.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CommandStatus(pub u32);

pub const ESME_ROK: CommandStatus = CommandStatus(0x0000_0000);
pub const ESME_RINVMSGLEN: CommandStatus = CommandStatus(0x0000_0001);
pub const ESME_RINVCMDLEN: CommandStatus = CommandStatus(0x0000_0002);
pub const ESME_RINVCMDID: CommandStatus = CommandStatus(0x0000_0003);
pub const ESME_RINVBNDSTS: CommandStatus = CommandStatus(0x0000_0004);
pub const ESME_RALYBND: CommandStatus = CommandStatus(0x0000_0005);
pub const ESME_RSYSERR: CommandStatus = CommandStatus(0x0000_0008);
pub const ESME_RINVSRCADR: CommandStatus = CommandStatus(0x0000_000A);
pub const ESME_RINVDSTADR: CommandStatus = CommandStatus(0x0000_000B);
pub const ESME_RINVMSGID: CommandStatus = CommandStatus(0x0000_000C);
pub const ESME_RBINDFAIL: CommandStatus = CommandStatus(0x0000_000D);
pub const ESME_RINVPASWD: CommandStatus = CommandStatus(0x0000_000E);
pub const ESME_RINVSYSID: CommandStatus = CommandStatus(0x0000_000F);
pub const ESME_RMSGQFUL: CommandStatus = CommandStatus(0x0000_0014);
pub const ESME_RINVESMCLASS: CommandStatus = CommandStatus(0x0000_0043);
pub const ESME_RTHROTTLED: CommandStatus = CommandStatus(0x0000_0058);
pub const ESME_RX_T_APPN: CommandStatus = CommandStatus(0x0000_0064);
pub const ESME_RX_P_APPN: CommandStatus = CommandStatus(0x0000_0065);
pub const ESME_RX_R_APPN: CommandStatus = CommandStatus(0x0000_0066);

impl CommandStatus {
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// True for statuses that signal a transient SMSC-side condition the
    /// message should be retried after.
    pub fn is_temporary(self) -> bool {
        self == ESME_RTHROTTLED || self == ESME_RMSGQFUL
    }

    /// True for bind rejections that will never succeed with the same
    /// credentials.
    pub fn is_credential_failure(self) -> bool {
        self == ESME_RINVSYSID || self == ESME_RINVPASWD
    }

    pub fn description(self) -> &'static str {
        match self {
            ESME_ROK => "OK",
            ESME_RINVMSGLEN => "invalid message length",
            ESME_RINVCMDLEN => "invalid command length",
            ESME_RINVCMDID => "invalid command id",
            ESME_RINVBNDSTS => "incorrect bind status for command",
            ESME_RALYBND => "already bound",
            ESME_RSYSERR => "system error",
            ESME_RINVSRCADR => "invalid source address",
            ESME_RINVDSTADR => "invalid destination address",
            ESME_RINVMSGID => "invalid message id",
            ESME_RBINDFAIL => "bind failed",
            ESME_RINVPASWD => "invalid password",
            ESME_RINVSYSID => "invalid system id",
            ESME_RMSGQFUL => "message queue full",
            ESME_RINVESMCLASS => "invalid esm_class",
            ESME_RTHROTTLED => "throttled",
            ESME_RX_T_APPN => "temporary application error",
            ESME_RX_P_APPN => "permanent application error",
            ESME_RX_R_APPN => "application rejected message",
            _ => "unknown status",
        }
    }
}

impl fmt::Debug for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandStatus({:#010x}, {})", self.0, self.description())
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x} ({})", self.0, self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(ESME_ROK.is_ok());
        assert!(ESME_RTHROTTLED.is_temporary());
        assert!(ESME_RMSGQFUL.is_temporary());
        assert!(!ESME_RSYSERR.is_temporary());
        assert!(ESME_RINVSYSID.is_credential_failure());
        assert!(ESME_RINVPASWD.is_credential_failure());
        assert!(!ESME_RBINDFAIL.is_credential_failure());
    }

    #[test]
    fn vendor_codes_survive() {
        let vendor = CommandStatus(0x0000_0410);
        assert_eq!(vendor.description(), "unknown status");
        assert_eq!(vendor.0, 0x410);
    }
}
