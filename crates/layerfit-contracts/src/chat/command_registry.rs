#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "prompt",
    action: "set_prompt",
}];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "upload",
        action: "upload",
    },
    CommandSpec {
        command: "save",
        action: "save",
    },
];

/// Commands addressing one slot: `<category> <index>` followed by an
/// optional source for the garment image.
pub(crate) const SLOT_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "replace",
        action: "replace_slot",
    },
    CommandSpec {
        command: "remove",
        action: "remove_slot",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "retry",
        action: "retry",
    },
    CommandSpec {
        command: "status",
        action: "status",
    },
    CommandSpec {
        command: "reset",
        action: "reset",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/upload <photo>",
    "/replace <category> <index> <path|url>",
    "/remove <category> <index>",
    "/prompt <text>",
    "/retry",
    "/status",
    "/save <path>",
    "/reset",
    "/help",
];
