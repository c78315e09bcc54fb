use super::*;

mod test_helpers {
    use super::*;

    pub(super) fn parse_args(argv: &[&str]) -> Args {
        Args::try_parse_from(argv)
            .unwrap_or_else(|err| panic!("argv={argv:?} should parse successfully: {err}"))
    }
}

use test_helpers::parse_args;

#[test]
fn no_subcommand_defaults_to_chat_options() {
    let argv = ["chatpipe"];
    let (command, options, debug_log) = parse_args(&argv).split();

    assert!(command.is_none(), "argv={argv:?} should not pick a subcommand");
    assert_eq!(options, RunOptions::default());
    assert!(debug_log.is_none());
}

#[test]
fn global_flags_apply_after_subcommand() {
    let argv = [
        "chatpipe", "chat", "--assistant", "coder", "-t", "abc", "-m", "llama3", "-l",
        "chat.log",
    ];
    let (command, options, _) = parse_args(&argv).split();

    assert!(matches!(command, Some(Commands::Chat)));
    assert_eq!(options.assistant.as_deref(), Some("coder"));
    assert_eq!(options.topic.as_deref(), Some("abc"));
    assert_eq!(options.model.as_deref(), Some("llama3"));
    assert_eq!(options.log, Some(PathBuf::from("chat.log")));
}

#[test]
fn say_collects_prompt_words() {
    let argv = ["chatpipe", "-m", "gpt-4o-mini", "say", "what", "is", "-1", "squared"];
    let (command, options, _) = parse_args(&argv).split();

    match command {
        Some(Commands::Say { prompt }) => assert_eq!(prompt.join(" "), "what is -1 squared"),
        _ => panic!("argv={argv:?} should parse as say"),
    }
    assert_eq!(options.model.as_deref(), Some("gpt-4o-mini"));
}

#[test]
fn debug_log_is_kept_apart_from_run_options() {
    let argv = ["chatpipe", "topics", "--debug-log", "trace.log"];
    let (command, options, debug_log) = parse_args(&argv).split();

    assert!(matches!(command, Some(Commands::Topics)));
    assert_eq!(options, RunOptions::default());
    assert_eq!(debug_log, Some(PathBuf::from("trace.log")));
}

#[test]
fn init_takes_a_force_flag() {
    let (command, _, _) = parse_args(&["chatpipe", "init"]).split();
    assert!(matches!(command, Some(Commands::Init { force: false })));

    let (command, _, _) = parse_args(&["chatpipe", "init", "--force"]).split();
    assert!(matches!(command, Some(Commands::Init { force: true })));
}

#[test]
fn unknown_subcommand_is_rejected() {
    assert!(Args::try_parse_from(["chatpipe", "dance"]).is_err());
}
