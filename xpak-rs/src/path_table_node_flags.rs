use bitflags::bitflags;

bitflags! {
    /// Flags for nodes in the TVFS path table.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PathTableNodeFlags: u32 {
        const PATH_SEPARATOR_PRE = 0x0001;
        const PATH_SEPARATOR_POST = 0x0002;
        const IS_NODE_VALUE = 0x0004;
    }
}
