// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Dependency expression bytecode found in PEI/DXE/SMM DepEx sections.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    format::{Error, Result},
    guid::Guid,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DepExOpCode {
    Before,
    After,
    Push,
    And,
    Or,
    Not,
    True,
    False,
    End,
    Sor,
}

impl DepExOpCode {
    pub fn from_raw(value: u8) -> Option<Self> {
        let opcode = match value {
            0x00 => Self::Before,
            0x01 => Self::After,
            0x02 => Self::Push,
            0x03 => Self::And,
            0x04 => Self::Or,
            0x05 => Self::Not,
            0x06 => Self::True,
            0x07 => Self::False,
            0x08 => Self::End,
            0x09 => Self::Sor,
            _ => return None,
        };

        Some(opcode)
    }

    pub fn to_raw(self) -> u8 {
        match self {
            Self::Before => 0x00,
            Self::After => 0x01,
            Self::Push => 0x02,
            Self::And => 0x03,
            Self::Or => 0x04,
            Self::Not => 0x05,
            Self::True => 0x06,
            Self::False => 0x07,
            Self::End => 0x08,
            Self::Sor => 0x09,
        }
    }

    /// Whether the opcode is followed by a GUID operand.
    pub fn takes_guid(self) -> bool {
        matches!(self, Self::Before | Self::After | Self::Push)
    }
}

impl fmt::Display for DepExOpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Before => "BEFORE",
            Self::After => "AFTER",
            Self::Push => "PUSH",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Not => "NOT",
            Self::True => "TRUE",
            Self::False => "FALSE",
            Self::End => "END",
            Self::Sor => "SOR",
        };

        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DepExOp {
    pub op_code: DepExOpCode,
    #[serde(rename = "GUID", default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<Guid>,
}

impl DepExOp {
    pub fn new(op_code: DepExOpCode) -> Self {
        Self {
            op_code,
            guid: None,
        }
    }

    pub fn with_guid(op_code: DepExOpCode, guid: Guid) -> Self {
        Self {
            op_code,
            guid: Some(guid),
        }
    }

    /// Build an op list from the command line syntax: either the literal
    /// `TRUE`, or whitespace separated GUIDs that must all be present.
    pub fn parse_expression(expr: &str) -> Result<Vec<Self>> {
        let expr = expr.trim();

        if expr.eq_ignore_ascii_case("TRUE") {
            return Ok(vec![Self::new(DepExOpCode::True), Self::new(DepExOpCode::End)]);
        }

        let guids = expr
            .split_whitespace()
            .map(|s| s.parse::<Guid>())
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if guids.is_empty() {
            return Err(Error::DepExEmpty);
        }

        let mut ops = guids
            .iter()
            .map(|g| Self::with_guid(DepExOpCode::Push, *g))
            .collect::<Vec<_>>();
        ops.extend((1..guids.len()).map(|_| Self::new(DepExOpCode::And)));
        ops.push(Self::new(DepExOpCode::End));

        Ok(ops)
    }
}

/// Decode a DepEx section payload. Bytes after the first `END` are ignored.
pub fn parse(buf: &[u8]) -> Result<Vec<DepExOp>> {
    let mut ops = vec![];
    let mut offset = 0;

    while let Some(&raw) = buf.get(offset) {
        let op_code = DepExOpCode::from_raw(raw).ok_or(Error::DepExUnknownOpcode(raw))?;
        offset += 1;

        let guid = if op_code.takes_guid() {
            let guid = Guid::from_slice(&buf[offset..])
                .ok_or_else(|| Error::truncated("DepEx GUID operand", 16, buf.len() - offset))?;
            offset += 16;
            Some(guid)
        } else {
            None
        };

        ops.push(DepExOp { op_code, guid });

        if op_code == DepExOpCode::End {
            return Ok(ops);
        }
    }

    Err(Error::DepExMissingEnd)
}

/// Encode an op list, checking that exactly the GUID-carrying opcodes have a
/// non-nil GUID.
pub fn encode(ops: &[DepExOp]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(ops.len() * 17);

    for op in ops {
        buf.push(op.op_code.to_raw());

        match (op.op_code.takes_guid(), &op.guid) {
            (true, Some(guid)) if !guid.is_zero() => buf.extend_from_slice(guid.bytes()),
            (true, _) => return Err(Error::DepExMissingGuid(op.op_code)),
            (false, Some(guid)) if !guid.is_zero() => {
                return Err(Error::DepExUnexpectedGuid(op.op_code));
            }
            (false, _) => {}
        }
    }

    Ok(buf)
}
