use nom::number::complete::{be_u8, le_u64};
use nom::IResult;

pub const ROLE_CLIENT: u8 = 0;
pub const ROLE_SERVER: u8 = 1;

pub const MSG_HELLO: u8 = 0;
pub const MSG_BYE: u8 = 1;

/// Length of an encoded [`Msg`].
pub const MSG_LEN: usize = 11;

/// The binary Hello/Bye message carried as UDP payload.
///
/// `ident` is little endian and names the session independently of
/// addresses and ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Msg {
    pub ident: u64,
    pub role: u8,
    pub msg: u8,
    pub cookie: u8,
}

impl Msg {
    pub fn new(ident: u64, role: u8, msg: u8, cookie: u8) -> Self {
        Msg {
            ident,
            role,
            msg,
            cookie,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Msg> {
        let (input, ident) = le_u64(input)?;
        let (input, role) = be_u8(input)?;
        let (input, msg) = be_u8(input)?;
        let (input, cookie) = be_u8(input)?;

        Ok((
            input,
            Msg {
                ident,
                role,
                msg,
                cookie,
            },
        ))
    }

    /// Write into the first [`MSG_LEN`] bytes of `out`.
    pub fn serialize(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.ident.to_le_bytes());
        out[8] = self.role;
        out[9] = self.msg;
        out[10] = self.cookie;
    }

    pub fn is(&self, role: u8, msg: u8) -> bool {
        self.role == role && self.msg == msg
    }
}
