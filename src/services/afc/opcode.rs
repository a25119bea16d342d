#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcOpcode {
    Status = 0x01,
    Data = 0x02,
    ReadDir = 0x03,
    RemovePath = 0x08,
    MakeDir = 0x09,
    GetFileInfo = 0x0a,
    GetDevInfo = 0x0b,
    FileOpen = 0x0d,
    FileOpenRes = 0x0e,
    Read = 0x0f,
    Write = 0x10,
    FileSeek = 0x11,
    FileTell = 0x12,
    FileTellRes = 0x13,
    FileClose = 0x14,
    RenamePath = 0x18,
    MakeLink = 0x1c,
    RemovePathAndContents = 0x22,
}

impl TryFrom<u64> for AfcOpcode {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Self::Status,
            0x02 => Self::Data,
            0x03 => Self::ReadDir,
            0x08 => Self::RemovePath,
            0x09 => Self::MakeDir,
            0x0a => Self::GetFileInfo,
            0x0b => Self::GetDevInfo,
            0x0d => Self::FileOpen,
            0x0e => Self::FileOpenRes,
            0x0f => Self::Read,
            0x10 => Self::Write,
            0x11 => Self::FileSeek,
            0x12 => Self::FileTell,
            0x13 => Self::FileTellRes,
            0x14 => Self::FileClose,
            0x18 => Self::RenamePath,
            0x1c => Self::MakeLink,
            0x22 => Self::RemovePathAndContents,
            other => return Err(other),
        })
    }
}

/// Open modes, named after their fopen equivalents
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcFopenMode {
    /// `r`
    RdOnly = 1,
    /// `r+`, creates the file
    Rw = 2,
    /// `w`, creates and truncates
    WrOnly = 3,
    /// `w+`
    Wr = 4,
    /// `a`
    Append = 5,
    /// `a+`
    RdAppend = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum LinkType {
    Hardlink = 1,
    Symlink = 2,
}
