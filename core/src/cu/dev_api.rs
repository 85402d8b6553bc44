//! The device API: what device implementations call to talk to the CSS.
//!
//! Each call prepares the devib's outbound operation and either sends it
//! immediately (tx engine free) or queues it behind in-progress sends.
//! The `_then` variants additionally install the callback index invoked
//! at the operation's next event; omitting it leaves the current
//! callback in place. Sends are validated against (and capped at) the
//! CSS-announced window.

use thiserror::Error;

use super::tx::{push_tx_list, send_command_to_css};
use super::Cu;
use crate::mem::Address;
use crate::proto::{CHOP_FLAG_FINAL, CHOP_FLAG_RESPONSE_REQUIRED};
use crate::status::{sense_code, DevStatus, Sense};
use crate::types::{CbIndex, UnitAddr};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevError {
    #[error("no callback registered at index {0}")]
    InvalidCallback(CbIndex),
    #[error("device has not received a Start")]
    NotStarted,
    #[error("current command is not Read-type")]
    CmdNotRead,
    #[error("current command is not Write-type")]
    CmdNotWrite,
    #[error("device status inconsistent with program state")]
    InvalidStatus,
}

impl DevError {
    /// The standard sense code matching this error.
    pub fn sense_code(self) -> u8 {
        match self {
            Self::InvalidCallback(_) => sense_code::INVALID_CALLBACK,
            Self::NotStarted => sense_code::NOT_STARTED,
            Self::CmdNotRead => sense_code::CMD_NOT_READ,
            Self::CmdNotWrite => sense_code::CMD_NOT_WRITE,
            Self::InvalidStatus => sense_code::INVALID_STATUS,
        }
    }
}

impl Cu {
    fn set_callback(&mut self, ua: UnitAddr, cbindex: Option<CbIndex>) -> Result<(), DevError> {
        let Some(n) = cbindex else {
            return Ok(());
        };
        if !self.callbacks().is_callable(n) {
            return Err(DevError::InvalidCallback(n));
        }
        self.devib_mut(ua).cbindex = n;
        Ok(())
    }

    /// Installs the callback invoked at the device's next event.
    pub fn dev_set_callback(
        &mut self,
        ua: UnitAddr,
        cbindex: Option<CbIndex>,
    ) -> Result<(), DevError> {
        self.set_callback(ua, cbindex)
    }

    fn send_or_queue_command(&mut self, ua: UnitAddr) {
        if push_tx_list(self, ua) {
            send_command_to_css(self);
        }
    }

    /// Enqueues a Data operation carrying `n` bytes from `srcaddr`
    /// (capped at the announced window). Returns the count actually
    /// sent.
    pub fn dev_send_then(
        &mut self,
        ua: UnitAddr,
        srcaddr: Address,
        n: u16,
        flags: u8,
        cbindex: Option<CbIndex>,
    ) -> Result<u16, DevError> {
        {
            let devib = self.devib(ua);
            if !devib.is_started() {
                return Err(DevError::NotStarted);
            }
            if devib.is_cmd_write() {
                return Err(DevError::CmdNotRead);
            }
        }
        self.set_callback(ua, cbindex)?;

        let devib = self.devib_mut(ua);
        let n = n.min(devib.size);
        devib.prepare_write_data(srcaddr, n, flags);
        self.send_or_queue_command(ua);
        Ok(n)
    }

    pub fn dev_send(
        &mut self,
        ua: UnitAddr,
        srcaddr: Address,
        n: u16,
        flags: u8,
    ) -> Result<u16, DevError> {
        self.dev_send_then(ua, srcaddr, n, flags, None)
    }

    /// Sends the final chunk of the device's data (End flag set).
    pub fn dev_send_final(&mut self, ua: UnitAddr, srcaddr: Address, n: u16) -> Result<u16, DevError> {
        self.dev_send_then(ua, srcaddr, n, CHOP_FLAG_FINAL, None)
    }

    pub fn dev_send_final_then(
        &mut self,
        ua: UnitAddr,
        srcaddr: Address,
        n: u16,
        cbindex: Option<CbIndex>,
    ) -> Result<u16, DevError> {
        self.dev_send_then(ua, srcaddr, n, CHOP_FLAG_FINAL, cbindex)
    }

    /// Sends a chunk that requires a Room update before the device may
    /// continue.
    pub fn dev_send_respond(
        &mut self,
        ua: UnitAddr,
        srcaddr: Address,
        n: u16,
    ) -> Result<u16, DevError> {
        self.dev_send_then(ua, srcaddr, n, CHOP_FLAG_RESPONSE_REQUIRED, None)
    }

    pub fn dev_send_respond_then(
        &mut self,
        ua: UnitAddr,
        srcaddr: Address,
        n: u16,
        cbindex: Option<CbIndex>,
    ) -> Result<u16, DevError> {
        self.dev_send_then(ua, srcaddr, n, CHOP_FLAG_RESPONSE_REQUIRED, cbindex)
    }

    pub fn dev_send_norespond(
        &mut self,
        ua: UnitAddr,
        srcaddr: Address,
        n: u16,
    ) -> Result<u16, DevError> {
        self.dev_send_then(ua, srcaddr, n, 0, None)
    }

    pub fn dev_send_norespond_then(
        &mut self,
        ua: UnitAddr,
        srcaddr: Address,
        n: u16,
        cbindex: Option<CbIndex>,
    ) -> Result<u16, DevError> {
        self.dev_send_then(ua, srcaddr, n, 0, cbindex)
    }

    /// Enqueues a Data+Skip operation: the CSS writes `n` zero bytes
    /// locally and nothing travels the link.
    pub fn dev_send_zeroes_then(
        &mut self,
        ua: UnitAddr,
        n: u16,
        flags: u8,
        cbindex: Option<CbIndex>,
    ) -> Result<u16, DevError> {
        {
            let devib = self.devib(ua);
            if !devib.is_started() {
                return Err(DevError::NotStarted);
            }
            if devib.is_cmd_write() {
                return Err(DevError::CmdNotRead);
            }
        }
        self.set_callback(ua, cbindex)?;

        let devib = self.devib_mut(ua);
        let n = n.min(devib.size);
        devib.prepare_write_zeroes(n, flags);
        self.send_or_queue_command(ua);
        Ok(n)
    }

    pub fn dev_send_zeroes(&mut self, ua: UnitAddr, n: u16, flags: u8) -> Result<u16, DevError> {
        self.dev_send_zeroes_then(ua, n, flags, None)
    }

    pub fn dev_send_zeroes_respond(&mut self, ua: UnitAddr, n: u16) -> Result<u16, DevError> {
        self.dev_send_zeroes_then(ua, n, CHOP_FLAG_RESPONSE_REQUIRED, None)
    }

    pub fn dev_send_zeroes_norespond(&mut self, ua: UnitAddr, n: u16) -> Result<u16, DevError> {
        self.dev_send_zeroes_then(ua, n, 0, None)
    }

    /// Enqueues a RequestRead for up to `size` bytes of the current
    /// Write-type segment into `dstaddr`.
    pub fn dev_receive_then(
        &mut self,
        ua: UnitAddr,
        dstaddr: Address,
        size: u16,
        cbindex: Option<CbIndex>,
    ) -> Result<(), DevError> {
        {
            let devib = self.devib(ua);
            if !devib.is_started() {
                return Err(DevError::NotStarted);
            }
            if !devib.is_cmd_write() {
                return Err(DevError::CmdNotWrite);
            }
        }
        self.set_callback(ua, cbindex)?;

        self.devib_mut(ua).prepare_read_data(dstaddr, size);
        self.send_or_queue_command(ua);
        Ok(())
    }

    pub fn dev_receive(&mut self, ua: UnitAddr, dstaddr: Address, size: u16) -> Result<(), DevError> {
        self.dev_receive_then(ua, dstaddr, size, None)
    }

    /// Enqueues an UpdateStatus, advertising `(dstaddr, size)` as the
    /// window a following Write-type Start may immediately send into.
    pub fn dev_update_status_advert_then(
        &mut self,
        ua: UnitAddr,
        devs: DevStatus,
        dstaddr: Address,
        size: u16,
        cbindex: Option<CbIndex>,
    ) -> Result<(), DevError> {
        self.set_callback(ua, cbindex)?;

        let devib = self.devib_mut(ua);
        if devib.is_started() != devs.channel_end() {
            return Err(DevError::InvalidStatus);
        }
        devib.prepare_update_status(devs, dstaddr, size);
        self.send_or_queue_command(ua);
        Ok(())
    }

    pub fn dev_update_status_advert(
        &mut self,
        ua: UnitAddr,
        devs: DevStatus,
        dstaddr: Address,
        size: u16,
    ) -> Result<(), DevError> {
        self.dev_update_status_advert_then(ua, devs, dstaddr, size, None)
    }

    pub fn dev_update_status_then(
        &mut self,
        ua: UnitAddr,
        devs: DevStatus,
        cbindex: Option<CbIndex>,
    ) -> Result<(), DevError> {
        self.dev_update_status_advert_then(ua, devs, 0, 0, cbindex)
    }

    pub fn dev_update_status(&mut self, ua: UnitAddr, devs: DevStatus) -> Result<(), DevError> {
        self.dev_update_status_advert_then(ua, devs, 0, 0, None)
    }

    /// Ends the channel program normally (ChannelEnd|DeviceEnd).
    pub fn dev_update_status_ok(&mut self, ua: UnitAddr) -> Result<(), DevError> {
        self.dev_update_status(ua, DevStatus::end_ok())
    }

    pub fn dev_update_status_ok_then(
        &mut self,
        ua: UnitAddr,
        cbindex: Option<CbIndex>,
    ) -> Result<(), DevError> {
        self.dev_update_status_then(ua, DevStatus::end_ok(), cbindex)
    }

    pub fn dev_update_status_ok_advert(
        &mut self,
        ua: UnitAddr,
        dstaddr: Address,
        size: u16,
    ) -> Result<(), DevError> {
        self.dev_update_status_advert(ua, DevStatus::end_ok(), dstaddr, size)
    }

    /// Ends the channel program with UNIT_CHECK and the given sense.
    pub fn dev_update_status_error_advert_then(
        &mut self,
        ua: UnitAddr,
        sense: Sense,
        dstaddr: Address,
        size: u16,
        cbindex: Option<CbIndex>,
    ) -> Result<(), DevError> {
        self.devib_mut(ua).sense = sense;
        let devs = DevStatus::end_ok().with_unit_check(true);
        self.dev_update_status_advert_then(ua, devs, dstaddr, size, cbindex)
    }

    pub fn dev_update_status_error_then(
        &mut self,
        ua: UnitAddr,
        sense: Sense,
        cbindex: Option<CbIndex>,
    ) -> Result<(), DevError> {
        self.dev_update_status_error_advert_then(ua, sense, 0, 0, cbindex)
    }

    pub fn dev_update_status_error_advert(
        &mut self,
        ua: UnitAddr,
        sense: Sense,
        dstaddr: Address,
        size: u16,
    ) -> Result<(), DevError> {
        self.dev_update_status_error_advert_then(ua, sense, dstaddr, size, None)
    }

    pub fn dev_update_status_error(&mut self, ua: UnitAddr, sense: Sense) -> Result<(), DevError> {
        self.dev_update_status_error_advert_then(ua, sense, 0, 0, None)
    }
}
