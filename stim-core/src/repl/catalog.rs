//! Shared REPL grammar specification expressed as an applicative AST.
//!
//! The parser and completion engine interpret the same structure, ensuring
//! keywords, defaults, and value layouts stay in sync.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandTag {
    Load,
    Start,
    Stop,
    Show,
    Status,
    Stimulate,
    Record,
    Label,
    SideEffect,
    Polarity,
    Recharge,
    Help,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubcommandTag {
    RecordStart,
    RecordStop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChoiceTag {
    StartRetryWindow,
    PolarityNormal,
    PolarityInverted,
    RechargeActive,
    RechargePassive,
    SideEffectPersistent,
    SideEffectTransient,
}

/// Settings accepted by `stimulate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldTag {
    Lead,
    Contacts,
    Return,
    Amplitude,
    PulseWidth,
    Frequency,
    Duration,
}

/// Value layout on the right of a `key=` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Index,
    /// Comma-separated contact indices.
    IndexList,
    /// Contact index, or `can` for the global return.
    ReturnContact,
    /// Integer or decimal literal.
    Number,
    Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub key: &'static str,
    pub tag: FieldTag,
    pub value: FieldValue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueSpec {
    None,
    DurationAssignment {
        suggestions: &'static [&'static str],
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelpTopics {
    None,
    Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub tag: CommandTag,
    pub grammar: &'static Node,
    pub help: HelpTopics,
    /// One-line usage shown by `help`.
    pub usage: &'static str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Node {
    End,
    OptionalChoice {
        choices: &'static [ChoiceBranch],
        default: Option<DefaultChoice>,
    },
    Subcommands(&'static [SubcommandBranch]),
    Topic {
        topics: HelpTopics,
        next: &'static Node,
    },
    /// Free-form word such as a sequence name or recording label.
    Argument {
        label: &'static str,
        required: bool,
        next: &'static Node,
    },
    /// Every field must appear exactly once, in any order.
    Fields {
        fields: &'static [FieldSpec],
        next: &'static Node,
    },
    /// Rest of the line taken verbatim.
    Text {
        label: &'static str,
        next: &'static Node,
    },
}

impl Node {
    /// Returns `true` when the node swallows arbitrary text, punctuation included.
    pub const fn takes_text(&self) -> bool {
        matches!(self, Node::Text { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChoiceBranch {
    pub keyword: &'static str,
    pub tag: ChoiceTag,
    pub value: ValueSpec,
    pub next: &'static Node,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefaultChoice {
    pub tag: ChoiceTag,
    pub next: &'static Node,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubcommandBranch {
    pub name: &'static str,
    pub tag: SubcommandTag,
    pub grammar: &'static Node,
}

const END: Node = Node::End;

const LOAD_GRAMMAR: Node = Node::Argument {
    label: "sequence name",
    required: true,
    next: &END,
};

const RETRY_WINDOW_SUGGESTIONS: [&str; 3] =
    ["retry-window=0s", "retry-window=2s", "retry-window=5s"];

const START_CHOICES: [ChoiceBranch; 1] = [ChoiceBranch {
    keyword: "retry-window",
    tag: ChoiceTag::StartRetryWindow,
    value: ValueSpec::DurationAssignment {
        suggestions: &RETRY_WINDOW_SUGGESTIONS,
    },
    next: &END,
}];

const START_GRAMMAR: Node = Node::OptionalChoice {
    choices: &START_CHOICES,
    default: None,
};

const RECORD_START_GRAMMAR: Node = Node::Argument {
    label: "recording label",
    required: false,
    next: &END,
};

const RECORD_SUBCOMMANDS: [SubcommandBranch; 2] = [
    SubcommandBranch {
        name: "start",
        tag: SubcommandTag::RecordStart,
        grammar: &RECORD_START_GRAMMAR,
    },
    SubcommandBranch {
        name: "stop",
        tag: SubcommandTag::RecordStop,
        grammar: &END,
    },
];

const RECORD_GRAMMAR: Node = Node::Subcommands(&RECORD_SUBCOMMANDS);

const POLARITY_CHOICES: [ChoiceBranch; 2] = [
    ChoiceBranch {
        keyword: "normal",
        tag: ChoiceTag::PolarityNormal,
        value: ValueSpec::None,
        next: &END,
    },
    ChoiceBranch {
        keyword: "inverted",
        tag: ChoiceTag::PolarityInverted,
        value: ValueSpec::None,
        next: &END,
    },
];

const POLARITY_GRAMMAR: Node = Node::OptionalChoice {
    choices: &POLARITY_CHOICES,
    default: None,
};

const RECHARGE_CHOICES: [ChoiceBranch; 2] = [
    ChoiceBranch {
        keyword: "active",
        tag: ChoiceTag::RechargeActive,
        value: ValueSpec::None,
        next: &END,
    },
    ChoiceBranch {
        keyword: "passive",
        tag: ChoiceTag::RechargePassive,
        value: ValueSpec::None,
        next: &END,
    },
];

const RECHARGE_GRAMMAR: Node = Node::OptionalChoice {
    choices: &RECHARGE_CHOICES,
    default: None,
};

const STIMULATE_FIELDS: [FieldSpec; 7] = [
    FieldSpec {
        key: "lead",
        tag: FieldTag::Lead,
        value: FieldValue::Index,
    },
    FieldSpec {
        key: "contacts",
        tag: FieldTag::Contacts,
        value: FieldValue::IndexList,
    },
    FieldSpec {
        key: "return",
        tag: FieldTag::Return,
        value: FieldValue::ReturnContact,
    },
    FieldSpec {
        key: "amp",
        tag: FieldTag::Amplitude,
        value: FieldValue::Number,
    },
    FieldSpec {
        key: "pw",
        tag: FieldTag::PulseWidth,
        value: FieldValue::Number,
    },
    FieldSpec {
        key: "freq",
        tag: FieldTag::Frequency,
        value: FieldValue::Number,
    },
    FieldSpec {
        key: "dur",
        tag: FieldTag::Duration,
        value: FieldValue::Duration,
    },
];

const STIMULATE_GRAMMAR: Node = Node::Fields {
    fields: &STIMULATE_FIELDS,
    next: &END,
};

const LABEL_GRAMMAR: Node = Node::Text {
    label: "label text",
    next: &END,
};

const SIDE_EFFECT_CHOICES: [ChoiceBranch; 2] = [
    ChoiceBranch {
        keyword: "persistent",
        tag: ChoiceTag::SideEffectPersistent,
        value: ValueSpec::None,
        next: &END,
    },
    ChoiceBranch {
        keyword: "transient",
        tag: ChoiceTag::SideEffectTransient,
        value: ValueSpec::None,
        next: &END,
    },
];

const SIDE_EFFECT_GRAMMAR: Node = Node::OptionalChoice {
    choices: &SIDE_EFFECT_CHOICES,
    default: None,
};

const HELP_GRAMMAR: Node = Node::Topic {
    topics: HelpTopics::Commands,
    next: &END,
};

const COMMANDS: [CommandSpec; 12] = [
    CommandSpec {
        name: "load",
        tag: CommandTag::Load,
        grammar: &LOAD_GRAMMAR,
        help: HelpTopics::None,
        usage: "load <name>                      load a sequence document and its waveforms",
    },
    CommandSpec {
        name: "start",
        tag: CommandTag::Start,
        grammar: &START_GRAMMAR,
        help: HelpTopics::None,
        usage: "start [retry-window=<duration>]  arm the loaded sequence at phase 1",
    },
    CommandSpec {
        name: "stop",
        tag: CommandTag::Stop,
        grammar: &END,
        help: HelpTopics::None,
        usage: "stop                             stop all stimulation and disarm",
    },
    CommandSpec {
        name: "show",
        tag: CommandTag::Show,
        grammar: &END,
        help: HelpTopics::None,
        usage: "show                             print the loaded sequence",
    },
    CommandSpec {
        name: "status",
        tag: CommandTag::Status,
        grammar: &END,
        help: HelpTopics::None,
        usage: "status                           report sequencer state",
    },
    CommandSpec {
        name: "stimulate",
        tag: CommandTag::Stimulate,
        grammar: &STIMULATE_GRAMMAR,
        help: HelpTopics::None,
        usage: "stimulate lead=<n> contacts=<a,b> return=<n|can> amp=<mA> pw=<us> freq=<Hz> dur=<duration>",
    },
    CommandSpec {
        name: "record",
        tag: CommandTag::Record,
        grammar: &RECORD_GRAMMAR,
        help: HelpTopics::None,
        usage: "record start [label] | record stop",
    },
    CommandSpec {
        name: "label",
        tag: CommandTag::Label,
        grammar: &LABEL_GRAMMAR,
        help: HelpTopics::None,
        usage: "label <text>                     annotate the recording",
    },
    CommandSpec {
        name: "side-effect",
        tag: CommandTag::SideEffect,
        grammar: &SIDE_EFFECT_GRAMMAR,
        help: HelpTopics::None,
        usage: "side-effect persistent|transient label the recording and append clinical notes",
    },
    CommandSpec {
        name: "polarity",
        tag: CommandTag::Polarity,
        grammar: &POLARITY_GRAMMAR,
        help: HelpTopics::None,
        usage: "polarity [normal|inverted]       show or change pulse polarity",
    },
    CommandSpec {
        name: "recharge",
        tag: CommandTag::Recharge,
        grammar: &RECHARGE_GRAMMAR,
        help: HelpTopics::None,
        usage: "recharge [active|passive]        show or change recharge mode",
    },
    CommandSpec {
        name: "help",
        tag: CommandTag::Help,
        grammar: &HELP_GRAMMAR,
        help: HelpTopics::Commands,
        usage: "help [topic]                     list commands",
    },
];

/// Returns the full command catalog.
#[must_use]
pub const fn commands() -> &'static [CommandSpec] {
    &COMMANDS
}

/// Looks up a command by its tag.
#[must_use]
pub fn command(tag: CommandTag) -> &'static CommandSpec {
    match tag {
        CommandTag::Load => &COMMANDS[0],
        CommandTag::Start => &COMMANDS[1],
        CommandTag::Stop => &COMMANDS[2],
        CommandTag::Show => &COMMANDS[3],
        CommandTag::Status => &COMMANDS[4],
        CommandTag::Stimulate => &COMMANDS[5],
        CommandTag::Record => &COMMANDS[6],
        CommandTag::Label => &COMMANDS[7],
        CommandTag::SideEffect => &COMMANDS[8],
        CommandTag::Polarity => &COMMANDS[9],
        CommandTag::Recharge => &COMMANDS[10],
        CommandTag::Help => &COMMANDS[11],
    }
}

/// Finds a command by name (case insensitive).
#[must_use]
pub fn find(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS
        .iter()
        .find(|command| command.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_map_back_to_their_names() {
        for spec in commands() {
            assert_eq!(command(spec.tag).name, spec.name);
        }
    }

    #[test]
    fn lookup_ignores_case() {
        assert_eq!(find("ReCoRd").map(|spec| spec.tag), Some(CommandTag::Record));
        assert!(find("calibrate").is_none());
        assert_eq!(find("Side-Effect").map(|spec| spec.tag), Some(CommandTag::SideEffect));
    }

    #[test]
    fn only_label_takes_free_text() {
        let free_text: alloc::vec::Vec<_> = commands()
            .iter()
            .filter(|spec| spec.grammar.takes_text())
            .map(|spec| spec.name)
            .collect();
        assert_eq!(free_text, ["label"]);
    }
}
