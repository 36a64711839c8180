// nodedb credential database firmware and supporting software libraries
//
// Copyright (C) 2024 Alekos Filini
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! On-flash node layouts.
//!
//! Parents take one base slot, children take two. Every node that is part of a sorted list
//! starts with the same [`NodeHeader`] so the list code never needs to know the node kind.

use core::cmp::Ordering;

use crate::address::NodeAddress;
use crate::flags::{NodeFlags, NodeType};
use crate::{CustChar, BASE_NODE_SIZE};

pub const PARENT_SIZE: usize = BASE_NODE_SIZE;
pub const CHILD_SIZE: usize = 2 * BASE_NODE_SIZE;

pub const SERVICE_LEN: usize = 126;
pub const LOGIN_LEN: usize = 64;
pub const DESCRIPTION_LEN: usize = 24;
pub const THIRD_FIELD_LEN: usize = 36;
pub const CTR_LEN: usize = 3;
pub const PASSWORD_LEN: usize = 128;
pub const TOTP_SECRET_LEN: usize = 64;
pub const DATA_CHUNK_LEN: usize = 256;
pub const DATA_PAYLOAD_LEN: usize = 2 * DATA_CHUNK_LEN;

pub const HEADER_SIZE: usize = 6;

struct Writer<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl<'b> Writer<'b> {
    fn new(buf: &'b mut [u8]) -> Self {
        Writer { buf, pos: 0 }
    }

    fn u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    fn addr(&mut self, addr: NodeAddress) {
        self.u16(addr.raw());
    }

    fn flags(&mut self, flags: NodeFlags) {
        self.u16(flags.to_raw());
    }

    fn bytes(&mut self, data: &[u8]) {
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
    }

    fn chars(&mut self, chars: &[CustChar]) {
        for c in chars {
            self.u16(*c);
        }
    }
}

struct Reader<'b> {
    buf: &'b [u8],
    pos: usize,
}

impl<'b> Reader<'b> {
    fn new(buf: &'b [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }

    fn u16(&mut self) -> u16 {
        let v = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        v
    }

    fn addr(&mut self) -> NodeAddress {
        NodeAddress::from_raw(self.u16())
    }

    fn flags(&mut self) -> NodeFlags {
        NodeFlags::from_raw(self.u16())
    }

    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn chars<const N: usize>(&mut self) -> [CustChar; N] {
        let mut out = [0u16; N];
        for c in out.iter_mut() {
            *c = self.u16();
        }
        out
    }
}

/// Compare two fixed-width keys in code unit order, stopping at the first common terminator
pub fn compare_keys(a: &[CustChar], b: &[CustChar]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.cmp(y) {
            Ordering::Equal if *x == 0 => return Ordering::Equal,
            Ordering::Equal => continue,
            other => return other,
        }
    }

    Ordering::Equal
}

/// Copy `src` into a fixed-width field, zero padding the rest
pub fn copy_key(dst: &mut [CustChar], src: &[CustChar]) {
    dst.fill(0);
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d = *s;
    }
}

/// Date packed as `YYYYYYYM MMMDDDDD` (year offset from 2010, month starting from zero),
/// stored byte swapped on flash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "emulator", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl NodeDate {
    pub const EPOCH_YEAR: u16 = 2010;

    pub fn new(year: u16, month: u8, day: u8) -> Self {
        NodeDate { year, month, day }
    }

    pub fn pack(&self) -> u16 {
        let packed = (self.day as u16 & 0x001F)
            | (((self.month as u16).wrapping_sub(1) << 5) & 0x03E0)
            | ((self.year.wrapping_sub(Self::EPOCH_YEAR) << 9) & 0xFE00);
        packed.swap_bytes()
    }

    /// `None` for the "never set" date
    pub fn unpack(raw: u16) -> Option<Self> {
        if raw == 0 {
            return None;
        }

        let packed = raw.swap_bytes();
        Some(NodeDate {
            year: (packed >> 9) + Self::EPOCH_YEAR,
            month: ((packed >> 5) & 0x0F) as u8 + 1,
            day: (packed & 0x1F) as u8,
        })
    }
}

/// Fields shared by every node taking part in a sorted list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub flags: NodeFlags,
    pub prev: NodeAddress,
    pub next: NodeAddress,
}

impl NodeHeader {
    pub fn new(flags: NodeFlags) -> Self {
        NodeHeader {
            flags,
            prev: NodeAddress::NULL,
            next: NodeAddress::NULL,
        }
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut r = Reader::new(buf);
        NodeHeader {
            flags: r.flags(),
            prev: r.addr(),
            next: r.addr(),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        let mut w = Writer::new(buf);
        w.flags(self.flags);
        w.addr(self.prev);
        w.addr(self.next);
    }
}

/// A node kind that lives in a sorted doubly linked list
pub trait ListNode: Sized {
    /// Size of the whole node in bytes
    const SIZE: usize;
    /// Byte offset of the sort key, always within the first slot
    const KEY_OFFSET: usize;
    /// Length of the sort key in characters
    const KEY_LEN: usize;

    fn header(&self) -> &NodeHeader;
    fn header_mut(&mut self) -> &mut NodeHeader;
    fn key(&self) -> &[CustChar];

    fn encode_into(&self, buf: &mut [u8]);
    fn decode_from(buf: &[u8]) -> Self;
}

/// Compare `key` with the key stored in the first slot of a list node
pub fn compare_with_stored<N: ListNode>(key: &[CustChar], head: &[u8]) -> Ordering {
    let mut stored = [0u16; SERVICE_LEN];
    let raw = &head[N::KEY_OFFSET..N::KEY_OFFSET + 2 * N::KEY_LEN];
    for (c, bytes) in stored.iter_mut().zip(raw.chunks_exact(2)) {
        *c = u16::from_le_bytes([bytes[0], bytes[1]]);
    }

    compare_keys(key, &stored[..N::KEY_LEN])
}

/// Credential or data parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentNode {
    pub header: NodeHeader,
    pub first_child: NodeAddress,
    pub service: [CustChar; SERVICE_LEN],
    tail: [u8; 4],
}

impl ParentNode {
    pub fn new(node_type: NodeType, service: &[CustChar]) -> Self {
        let mut node = ParentNode {
            header: NodeHeader::new(NodeFlags::new(node_type, 0)),
            first_child: NodeAddress::NULL,
            service: [0; SERVICE_LEN],
            tail: [0; 4],
        };
        copy_key(&mut node.service, service);
        node
    }

    pub fn flags(&self) -> NodeFlags {
        self.header.flags
    }

    /// Last child used, credential parents only
    pub fn last_child_used(&self) -> NodeAddress {
        NodeAddress::from_raw(u16::from_le_bytes([self.tail[0], self.tail[1]]))
    }

    pub fn set_last_child_used(&mut self, addr: NodeAddress) {
        self.tail[..2].copy_from_slice(&addr.to_le_bytes());
    }

    /// Encryption counter the data chain starts from, data parents only
    pub fn data_ctr(&self) -> [u8; CTR_LEN] {
        [self.tail[1], self.tail[2], self.tail[3]]
    }

    pub fn set_data_ctr(&mut self, ctr: [u8; CTR_LEN]) {
        self.tail[1..].copy_from_slice(&ctr);
    }

    /// Force the string terminator, in case the stored one is missing
    pub fn clean_strings(&mut self) {
        self.service[SERVICE_LEN - 1] = 0;
    }

    pub fn to_bytes(&self) -> [u8; PARENT_SIZE] {
        let mut buf = [0u8; PARENT_SIZE];
        self.encode_into(&mut buf);
        buf
    }
}

impl ListNode for ParentNode {
    const SIZE: usize = PARENT_SIZE;
    const KEY_OFFSET: usize = 8;
    const KEY_LEN: usize = SERVICE_LEN;

    fn header(&self) -> &NodeHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut NodeHeader {
        &mut self.header
    }

    fn key(&self) -> &[CustChar] {
        &self.service
    }

    fn encode_into(&self, buf: &mut [u8]) {
        self.header.encode(&mut buf[..HEADER_SIZE]);
        let mut w = Writer::new(&mut buf[HEADER_SIZE..PARENT_SIZE]);
        w.addr(self.first_child);
        w.chars(&self.service);
        w.bytes(&self.tail);
    }

    fn decode_from(buf: &[u8]) -> Self {
        let header = NodeHeader::decode(&buf[..HEADER_SIZE]);
        let mut r = Reader::new(&buf[HEADER_SIZE..PARENT_SIZE]);
        ParentNode {
            header,
            first_child: r.addr(),
            service: r.chars(),
            tail: r.array(),
        }
    }
}

/// TOTP block of a credential child, starting at byte 400 of the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TotpParams {
    /// Encrypted secret
    pub secret: [u8; TOTP_SECRET_LEN],
    pub secret_len: u16,
    /// Seconds, at most 99
    pub time_step: u8,
    /// 0 for SHA1, 1 for SHA256, 2 for SHA512
    pub sha_version: u8,
    pub digits: u8,
    /// Encryption counter of the secret
    pub ctr: [u8; CTR_LEN],
    reserved: [u8; 2],
}

impl TotpParams {
    pub fn empty() -> Self {
        TotpParams {
            secret: [0; TOTP_SECRET_LEN],
            secret_len: 0,
            time_step: 0,
            sha_version: 0,
            digits: 0,
            ctr: [0; CTR_LEN],
            reserved: [0; 2],
        }
    }
}

/// Credential child: a login under a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredChildNode {
    pub header: NodeHeader,
    pub mirrored_child: NodeAddress,
    /// Packed [`NodeDate`], zero when unset
    pub date_created: u16,
    pub date_last_used: u16,
    pub login: [CustChar; LOGIN_LEN],
    pub description: [CustChar; DESCRIPTION_LEN],
    pub third_field: [CustChar; THIRD_FIELD_LEN],
    pub key_after_login: u16,
    pub key_after_password: u16,
    pub fake_flags: NodeFlags,
    pub password_blank: u8,
    pub ctr: [u8; CTR_LEN],
    pub password: [u8; PASSWORD_LEN],
    pub password_terminator: u16,
    pub totp: TotpParams,
    reserved: [u8; 54],
}

impl CredChildNode {
    pub fn new(login: &[CustChar]) -> Self {
        let flags = NodeFlags::new(NodeType::CredChild, 0);
        let mut node = CredChildNode {
            header: NodeHeader::new(flags),
            mirrored_child: NodeAddress::NULL,
            date_created: 0,
            date_last_used: 0,
            login: [0; LOGIN_LEN],
            description: [0; DESCRIPTION_LEN],
            third_field: [0; THIRD_FIELD_LEN],
            key_after_login: 0,
            key_after_password: 0,
            fake_flags: flags.mirrored(),
            password_blank: 0,
            ctr: [0; CTR_LEN],
            password: [0; PASSWORD_LEN],
            password_terminator: 0,
            totp: TotpParams::empty(),
            reserved: [0; 54],
        };
        copy_key(&mut node.login, login);
        node
    }

    pub fn flags(&self) -> NodeFlags {
        self.header.flags
    }

    /// Set the header flags and derive the mirrored copy from them
    pub fn set_flags(&mut self, flags: NodeFlags) {
        self.header.flags = flags;
        self.fake_flags = flags.mirrored();
    }

    pub fn clean_strings(&mut self) {
        self.password_terminator = 0;
        self.login[LOGIN_LEN - 1] = 0;
        self.description[DESCRIPTION_LEN - 1] = 0;
        self.third_field[THIRD_FIELD_LEN - 1] = 0;
    }

    /// Drop the secret fields, for reads that must not expose them
    pub fn clear_password(&mut self) {
        self.password = [0; PASSWORD_LEN];
        self.ctr = [0; CTR_LEN];
        self.totp = TotpParams::empty();
    }

    pub fn to_bytes(&self) -> [u8; CHILD_SIZE] {
        let mut buf = [0u8; CHILD_SIZE];
        self.encode_into(&mut buf);
        buf
    }
}

impl ListNode for CredChildNode {
    const SIZE: usize = CHILD_SIZE;
    const KEY_OFFSET: usize = 12;
    const KEY_LEN: usize = LOGIN_LEN;

    fn header(&self) -> &NodeHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut NodeHeader {
        &mut self.header
    }

    fn key(&self) -> &[CustChar] {
        &self.login
    }

    fn encode_into(&self, buf: &mut [u8]) {
        self.header.encode(&mut buf[..HEADER_SIZE]);
        let mut w = Writer::new(&mut buf[HEADER_SIZE..CHILD_SIZE]);
        w.addr(self.mirrored_child);
        w.u16(self.date_created);
        w.u16(self.date_last_used);
        w.chars(&self.login);
        w.chars(&self.description);
        w.chars(&self.third_field);
        w.u16(self.key_after_login);
        w.u16(self.key_after_password);
        w.flags(self.fake_flags);
        w.u8(self.password_blank);
        w.bytes(&self.ctr);
        w.bytes(&self.password);
        w.u16(self.password_terminator);
        w.bytes(&self.totp.secret);
        w.u16(self.totp.secret_len);
        w.u8(self.totp.time_step);
        w.u8(self.totp.sha_version);
        w.u8(self.totp.digits);
        w.bytes(&self.totp.ctr);
        w.bytes(&self.totp.reserved);
        w.bytes(&self.reserved);
    }

    fn decode_from(buf: &[u8]) -> Self {
        let header = NodeHeader::decode(&buf[..HEADER_SIZE]);
        let mut r = Reader::new(&buf[HEADER_SIZE..CHILD_SIZE]);
        CredChildNode {
            header,
            mirrored_child: r.addr(),
            date_created: r.u16(),
            date_last_used: r.u16(),
            login: r.chars(),
            description: r.chars(),
            third_field: r.chars(),
            key_after_login: r.u16(),
            key_after_password: r.u16(),
            fake_flags: r.flags(),
            password_blank: r.u8(),
            ctr: r.array(),
            password: r.array(),
            password_terminator: r.u16(),
            totp: TotpParams {
                secret: r.array(),
                secret_len: r.u16(),
                time_step: r.u8(),
                sha_version: r.u8(),
                digits: r.u8(),
                ctr: r.array(),
                reserved: r.array(),
            },
            reserved: r.array(),
        }
    }
}

/// Data child: one link of a data parent's payload chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChildNode {
    pub flags: NodeFlags,
    pub next: NodeAddress,
    pub data_length: u16,
    pub data: [u8; DATA_PAYLOAD_LEN],
    pub fake_flags: NodeFlags,
    reserved: [u8; 2],
    reserved2: [u8; 6],
}

impl DataChildNode {
    pub fn new(payload: &[u8]) -> Self {
        let flags = NodeFlags::new(NodeType::DataChild, 0);
        let len = core::cmp::min(payload.len(), DATA_PAYLOAD_LEN);
        let mut data = [0u8; DATA_PAYLOAD_LEN];
        data[..len].copy_from_slice(&payload[..len]);

        DataChildNode {
            flags,
            next: NodeAddress::NULL,
            data_length: len as u16,
            data,
            fake_flags: flags.mirrored(),
            reserved: [0; 2],
            reserved2: [0; 6],
        }
    }

    pub fn set_flags(&mut self, flags: NodeFlags) {
        self.flags = flags;
        self.fake_flags = flags.mirrored();
    }

    pub fn to_bytes(&self) -> [u8; CHILD_SIZE] {
        let mut buf = [0u8; CHILD_SIZE];
        let mut w = Writer::new(&mut buf);
        w.flags(self.flags);
        w.addr(self.next);
        w.u16(self.data_length);
        w.bytes(&self.data[..DATA_CHUNK_LEN]);
        w.bytes(&self.reserved);
        w.flags(self.fake_flags);
        w.bytes(&self.data[DATA_CHUNK_LEN..]);
        w.bytes(&self.reserved2);
        buf
    }

    pub fn from_bytes(buf: &[u8; CHILD_SIZE]) -> Self {
        let mut r = Reader::new(buf);
        let flags = r.flags();
        let next = r.addr();
        let data_length = r.u16();
        let mut data = [0u8; DATA_PAYLOAD_LEN];
        data[..DATA_CHUNK_LEN].copy_from_slice(&r.array::<DATA_CHUNK_LEN>());
        let reserved = r.array();
        let fake_flags = r.flags();
        data[DATA_CHUNK_LEN..].copy_from_slice(&r.array::<DATA_CHUNK_LEN>());

        DataChildNode {
            flags,
            next,
            data_length,
            data,
            fake_flags,
            reserved,
            reserved2: r.array(),
        }
    }
}

/// Offset of the data chain link within a data child
pub const DATA_NEXT_OFFSET: usize = 2;
