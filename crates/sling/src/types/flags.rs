use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Flags: u8 {
        const REMOTE_CLOSED = 0x01;
        const REMOTE_OPEN = 0x02;
        const NO_DATA = 0x04;
    }
}

impl Flags {
    /// The frame ends its direction of the stream and carries nothing else.
    pub fn is_close(self) -> bool {
        self.contains(Flags::REMOTE_CLOSED | Flags::NO_DATA)
    }
}
