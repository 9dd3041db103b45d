mod common;

use common::*;
use object::{Object, ObjectSymbol};
use rewrite_server::core::{HelperKind, LiftError, SessionError};
use rewrite_server::protocol::{MsgId, ServerConfig};

// mov rax, rdi; add rax, 1; ret; padded with nop
const ADD_ONE: [u8; 16] = [
    0x48, 0x89, 0xf8, 0x48, 0x83, 0xc0, 0x01, 0xc3, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
    0x90,
];

// syscall; ret
const SYSCALL_RET: [u8; 3] = [0x0f, 0x05, 0xc3];

fn default_session(script: Vec<Vec<u8>>, responder: Responder) -> ScriptedClient {
    let mut messages = vec![init(&ServerConfig::default())];
    messages.extend(script);
    ScriptedClient::new(messages, responder)
}

fn symbol_names(elf: &[u8]) -> Vec<String> {
    let file = object::File::parse(elf).unwrap();
    file.symbols()
        .filter_map(|s| s.name().ok().map(str::to_string))
        .filter(|name| !name.is_empty())
        .collect()
}

#[test]
fn translate_returns_elf_object() {
    let _ = env_logger::builder().is_test(true).try_init();
    let client = default_session(vec![translate(0x1000), exit()], image(0x1000, &ADD_ONE));
    let session = serve(&client).ok().unwrap();

    assert_eq!(client.memory_requests()[0], (0x1000, 16));
    let objects = client.objects();
    assert_eq!(objects.len(), 1);
    assert!(!objects[0].is_empty());

    let file = object::File::parse(&*objects[0]).unwrap();
    assert_eq!(file.architecture(), object::Architecture::X86_64);
    let func = file.symbol_by_name("func_1000").unwrap();
    assert!(func.is_global());
    assert!(func.is_definition());
    assert_eq!(session.translated(), 1);
}

#[test]
fn failed_first_fetch_is_fatal() {
    let mut reply = ADD_ONE.to_vec();
    reply.push(1);
    let client = default_session(vec![translate(0x1000), exit()], fixed(&reply));

    let err = serve(&client).err().unwrap();
    assert!(matches!(
        err,
        SessionError::Lift(LiftError::NothingDecoded { addr: 0x1000 })
    ));
    assert!(client.objects().is_empty());
}

#[test]
fn translate_before_init_is_rejected() {
    let client = ScriptedClient::new(vec![translate(0x1000)], image(0x1000, &ADD_ONE));

    let err = serve(&client).err().unwrap();
    assert!(matches!(err, SessionError::ExpectedInit { id } if id == MsgId::C_TRANSLATE));
    assert!(client.received().is_empty());
}

#[test]
fn exit_after_handshake_sends_nothing() {
    let client = default_session(vec![exit()], image(0x1000, &ADD_ONE));
    let session = serve(&client).ok().unwrap();

    assert!(client.received().is_empty());
    assert_eq!(session.translated(), 0);
}

#[test]
fn empty_memory_reply_fetches_nothing() {
    let client = default_session(vec![translate(0x1000), exit()], fixed(&[]));

    let err = serve(&client).err().unwrap();
    assert!(matches!(
        err,
        SessionError::Lift(LiftError::NothingDecoded { addr: 0x1000 })
    ));
    assert_eq!(client.memory_requests()[0], (0x1000, 16));
}

#[test]
fn repeated_translation_is_deterministic() {
    let client = default_session(
        vec![translate(0x2000), translate(0x2000), exit()],
        image(0x2000, &ADD_ONE),
    );
    serve(&client).ok().unwrap();

    let objects = client.objects();
    assert_eq!(objects.len(), 2);
    assert_eq!(objects[0], objects[1]);
}

#[test]
fn module_returns_to_helper_set_after_each_request() {
    let mut code = ADD_ONE.to_vec();
    code.resize(0x100, 0x90);
    code[0x80..0x83].copy_from_slice(&SYSCALL_RET);
    let client = default_session(
        vec![translate(0x1000), translate(0x1080), translate(0x1000), exit()],
        image(0x1000, &code),
    );
    let session = serve(&client).ok().unwrap();

    assert_eq!(session.translated(), 3);
    assert!(session.helpers().is_session_shape(session.module()));
    let names: Vec<_> = session
        .module()
        .functions()
        .map(|(_, f)| f.name.clone())
        .collect();
    assert_eq!(names, ["syscall", "noop_stub", "cpuid", "rdtsc"]);
    for kind in HelperKind::ALL {
        assert!(!session.helpers().is_detached(kind));
    }
}

#[test]
fn unused_helpers_are_left_out_of_the_object() {
    let mut code = ADD_ONE.to_vec();
    code.resize(0x100, 0x90);
    code[0x80..0x83].copy_from_slice(&SYSCALL_RET);
    let client = default_session(
        vec![translate(0x1000), translate(0x1080), exit()],
        image(0x1000, &code),
    );
    serve(&client).ok().unwrap();

    let objects = client.objects();
    let plain = symbol_names(&objects[0]);
    assert!(plain.contains(&"func_1000".to_string()));
    assert!(!plain.contains(&"syscall".to_string()));

    let with_syscall = symbol_names(&objects[1]);
    assert!(with_syscall.contains(&"func_1080".to_string()));
    assert!(with_syscall.contains(&"syscall".to_string()));
    assert!(!with_syscall.contains(&"func_1000".to_string()));

    let file = object::File::parse(&*objects[1]).unwrap();
    assert!(file.symbol_by_name("syscall").unwrap().is_undefined());
}

#[test]
fn nothing_is_sent_after_exit() {
    let client = default_session(
        vec![translate(0x1000), exit(), translate(0x1000), exit()],
        image(0x1000, &ADD_ONE),
    );
    serve(&client).ok().unwrap();

    assert_eq!(client.objects().len(), 1);
    assert_eq!(client.unread_script(), 2);
    let (last, _) = client.received().pop().unwrap();
    assert_eq!(last, MsgId::S_OBJECT);
}

#[test]
fn unexpected_top_level_message_is_fatal() {
    let client = default_session(
        vec![frame(MsgId::C_MEMBUF, &[0]), exit()],
        image(0x1000, &ADD_ONE),
    );

    let err = serve(&client).err().unwrap();
    assert!(matches!(err, SessionError::UnexpectedMessage { id } if id == MsgId::C_MEMBUF));
    assert!(client.received().is_empty());
}

#[test]
fn hhvm_and_unoptimized_sessions_still_translate() {
    let configs = [
        ServerConfig {
            hhvm: true,
            ..ServerConfig::default()
        },
        ServerConfig {
            opt_pass_pipeline: 0,
            ..ServerConfig::default()
        },
        ServerConfig {
            opt_unsafe_callret: true,
            native_segments: true,
            ..ServerConfig::default()
        },
    ];
    let mut objects = Vec::new();
    for config in configs {
        let client = ScriptedClient::new(
            vec![init(&config), translate(0x1000), exit()],
            image(0x1000, &ADD_ONE),
        );
        let session = serve(&client).ok().unwrap();
        assert_eq!(session.config(), &config);
        let object = client.objects().pop().unwrap();
        assert!(symbol_names(&object).contains(&"func_1000".to_string()));
        objects.push(object);
    }
    assert_ne!(objects[0], objects[1]);
}

#[test]
fn object_dump_matches_sent_object() {
    let dir = std::env::temp_dir().join(format!("rewrite-server-dump-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let config = ServerConfig {
        debug_dump_objects: true,
        debug_dump_dir: dir.to_string_lossy().into_owned(),
        ..ServerConfig::default()
    };
    let client = ScriptedClient::new(
        vec![init(&config), translate(0x3000), exit()],
        image(0x3000, &ADD_ONE),
    );
    serve(&client).ok().unwrap();

    let dumped = std::fs::read(dir.join("func_3000.elf")).unwrap();
    assert_eq!(dumped, client.objects()[0]);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn dump_failure_does_not_stop_the_session() {
    let config = ServerConfig {
        debug_dump_objects: true,
        debug_dump_dir: "/nonexistent/rewrite-server".into(),
        ..ServerConfig::default()
    };
    let client = ScriptedClient::new(
        vec![init(&config), translate(0x3000), translate(0x3000), exit()],
        image(0x3000, &ADD_ONE),
    );

    let session = serve(&client).ok().unwrap();
    assert_eq!(session.translated(), 2);
    assert_eq!(client.objects().len(), 2);
    assert_eq!(client.unread_script(), 0);
}
