use tokio_util::sync::CancellationToken;
use vectorset::config::Config;
use vectorset::engine::{Engine, Reply};

fn engine() -> Engine {
    Engine::new(Config::default(), CancellationToken::new()).unwrap()
}

fn int(reply: Reply) -> i64 {
    reply
        .as_integer()
        .unwrap_or_else(|| panic!("expected integer, got {reply:?}"))
}

fn error(reply: Reply) -> String {
    match reply {
        Reply::Error(msg) => msg,
        other => panic!("expected error, got {other:?}"),
    }
}

fn labels(reply: &Reply) -> Vec<String> {
    reply
        .as_array()
        .unwrap_or_else(|| panic!("expected array, got {reply:?}"))
        .iter()
        .map(|r| String::from_utf8(r.as_bytes().unwrap().to_vec()).unwrap())
        .collect()
}

#[test]
fn add_search_and_cardinality() {
    let engine = engine();
    assert_eq!(int(engine.command(["VADD", "k", "VALUES", "3", "1", "0", "0", "a"])), 1);
    assert_eq!(int(engine.command(["VADD", "k", "VALUES", "3", "0", "1", "0", "b"])), 1);
    assert_eq!(int(engine.command(["VADD", "k", "VALUES", "3", "0", "0", "1", "c"])), 1);
    assert_eq!(int(engine.command(["VCARD", "k"])), 3);
    assert_eq!(int(engine.command(["VDIM", "k"])), 3);

    let hits = engine.command(["VSIM", "k", "VALUES", "3", "0.9", "0.1", "0", "COUNT", "1"]);
    assert_eq!(labels(&hits), vec!["a"]);

    let scored = engine.command(["VSIM", "k", "ELE", "b", "WITHSCORES", "COUNT", "2"]);
    let score = scored.field("b").cloned();
    match score {
        Some(Reply::Double(s)) => assert!(s > 0.99, "self similarity {s}"),
        other => panic!("unexpected score {other:?}"),
    }

    let all = engine.command(["VSIM", "k", "ELE", "a", "NOTHREAD"]);
    assert_eq!(labels(&all).len(), 3);
}

#[test]
fn update_keeps_cardinality_and_latest_vector() {
    let engine = engine();
    engine.command(["VADD", "k", "VALUES", "2", "1", "0", "a", "NOQUANT"]);
    engine.command(["VADD", "k", "VALUES", "2", "0", "1", "b", "NOQUANT"]);
    assert_eq!(int(engine.command(["VADD", "k", "VALUES", "2", "0", "3", "a", "NOQUANT"])), 0);
    assert_eq!(int(engine.command(["VCARD", "k"])), 2);

    let emb = engine.command(["VEMB", "k", "a"]);
    let values: Vec<f64> = emb
        .as_array()
        .unwrap()
        .iter()
        .map(|r| match r {
            Reply::Double(v) => *v,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert!(values[0].abs() < 1e-5);
    assert!((values[1] - 3.0).abs() < 1e-5);
}

#[test]
fn plain_add_into_unquantized_set_is_rejected() {
    let engine = engine();
    assert_eq!(int(engine.command(["VADD", "k", "VALUES", "2", "1", "0", "a", "NOQUANT"])), 1);
    assert_eq!(
        error(engine.command(["VADD", "k", "VALUES", "2", "0", "1", "b"])),
        "ERR use the same quantization of the existing vector set"
    );
    assert_eq!(int(engine.command(["VCARD", "k"])), 1);

    engine.command(["VADD", "bits", "VALUES", "2", "1", "0", "a", "BIN"]);
    assert_eq!(
        error(engine.command(["VADD", "bits", "VALUES", "2", "0", "1", "b", "Q8"])),
        "ERR use the same quantization of the existing vector set"
    );
}

#[test]
fn oversized_value_count_leaves_engine_running() {
    let engine = engine();
    let reply = engine.command(["VADD", "k", "VALUES", "18446744073709551615", "1", "e"]);
    assert!(reply.is_error(), "{reply:?}");
    assert_ne!(error(reply), "ERR engine is shutting down");
    assert_eq!(engine.command(["PING"]), Reply::Simple("PONG".into()));
    assert_eq!(int(engine.command(["VADD", "k", "VALUES", "1", "1", "e"])), 1);
}

#[test]
fn validation_errors() {
    let engine = engine();
    engine.command(["VADD", "k", "VALUES", "4", "1", "0", "0", "0", "a"]);

    assert_eq!(
        error(engine.command(["VADD", "k", "VALUES", "3", "1", "0", "0", "b"])),
        "ERR Vector dimension mismatch - got 3 but set has 4"
    );
    assert_eq!(
        error(engine.command(["VADD", "k", "VALUES", "4", "1", "0", "0", "0", "b", "BIN"])),
        "ERR use the same quantization of the existing vector set"
    );
    assert_eq!(
        error(engine.command(["VADD", "k", "VALUES", "4", "1", "0", "0", "0", "b", "EF", "0"])),
        "ERR invalid EF"
    );
    assert_eq!(
        error(engine.command(["VADD", "k", "VALUES", "4", "1", "0", "0", "0", "b", "WAT"])),
        "ERR invalid option after element"
    );
    assert_eq!(
        error(engine.command(["VADD", "k", "REDUCE", "2", "VALUES", "4", "1", "0", "0", "0", "b"])),
        "ERR cannot add projection to existing set without projection"
    );
    assert_eq!(
        error(engine.command(["VSIM", "k", "VALUES", "4", "1", "0", "0", "0", "COUNT", "0"])),
        "ERR invalid COUNT"
    );
    assert_eq!(
        error(engine.command(["VSIM", "k", "VALUES", "4", "1", "0", "0", "0", "BOGUS"])),
        "ERR syntax error in VSIM command"
    );
    assert_eq!(
        error(engine.command(["VSIM", "k", "ELE", "missing"])),
        "ERR element not found in set"
    );
    assert_eq!(
        error(engine.command(["VSIM", "k", "VALUES", "2", "1", "0"])),
        "ERR Vector dimension mismatch - got 2 but set has 4"
    );
    assert_eq!(error(engine.command(["VDIM", "nope"])), "ERR key does not exist");
    assert_eq!(int(engine.command(["VCARD", "k"])), 1);
}

#[test]
fn missing_keys_and_wrong_types() {
    let engine = engine();
    assert_eq!(engine.command(["VSIM", "nope", "VALUES", "1", "1"]), Reply::Array(vec![]));
    assert_eq!(int(engine.command(["VCARD", "nope"])), 0);
    assert_eq!(int(engine.command(["VREM", "nope", "a"])), 0);
    assert_eq!(engine.command(["VEMB", "nope", "a"]), Reply::Null);
    assert_eq!(engine.command(["VINFO", "nope"]), Reply::NullArray);

    assert_eq!(engine.command(["SET", "s", "hello"]), Reply::Ok);
    assert_eq!(engine.command(["TYPE", "s"]), Reply::Simple("string".to_string()));
    let wrong = error(engine.command(["VADD", "s", "VALUES", "1", "1", "a"]));
    assert!(wrong.starts_with("WRONGTYPE"));
    assert!(error(engine.command(["VCARD", "s"])).starts_with("WRONGTYPE"));
    assert_eq!(engine.command(["GET", "s"]), Reply::Bulk(b"hello".to_vec()));
}

#[test]
fn removing_last_element_deletes_the_key() {
    let engine = engine();
    engine.command(["VADD", "k", "VALUES", "2", "1", "0", "a"]);
    engine.command(["VADD", "k", "VALUES", "2", "0", "1", "b"]);
    assert_eq!(int(engine.command(["VREM", "k", "a"])), 1);
    assert_eq!(int(engine.command(["VREM", "k", "a"])), 0);
    assert_eq!(engine.command(["VEMB", "k", "a"]), Reply::Null);
    assert_eq!(int(engine.command(["VCARD", "k"])), 1);
    assert_eq!(int(engine.command(["VREM", "k", "b"])), 1);
    assert_eq!(int(engine.command(["EXISTS", "k"])), 0);
    assert_eq!(engine.command(["TYPE", "k"]), Reply::Simple("none".to_string()));
}

#[test]
fn background_insert_matches_synchronous_insert() {
    let engine = engine();
    engine.command(["VADD", "k", "VALUES", "3", "1", "0", "0", "a"]);
    assert_eq!(
        int(engine.command(["VADD", "k", "VALUES", "3", "0", "1", "0", "b", "CAS"])),
        1
    );
    assert_eq!(int(engine.command(["VCARD", "k"])), 2);
    let hits = engine.command(["VSIM", "k", "ELE", "b", "COUNT", "1"]);
    assert_eq!(labels(&hits), vec!["b"]);

    // an existing element goes through the synchronous update path
    assert_eq!(
        int(engine.command(["VADD", "k", "VALUES", "3", "0", "0", "1", "b", "CAS"])),
        0
    );
    let metrics = engine.metrics().snapshot();
    assert_eq!(metrics.inserts_background, 1);
    assert_eq!(metrics.commits_optimistic + metrics.commits_fallback, 1);
}

#[test]
fn projected_sets() {
    let engine = engine();
    assert_eq!(
        int(engine.command(["VADD", "p", "REDUCE", "2", "VALUES", "4", "1", "0", "0", "0", "x"])),
        1
    );
    assert_eq!(int(engine.command(["VDIM", "p"])), 2);
    assert_eq!(
        int(engine.command(["VADD", "p", "VALUES", "4", "0", "1", "0", "0", "y"])),
        1
    );
    assert_eq!(
        error(engine.command(["VADD", "p", "REDUCE", "3", "VALUES", "4", "0", "0", "1", "0", "z"])),
        "ERR projection dimension mismatch with existing set"
    );

    let info = engine.command(["VINFO", "p"]);
    assert_eq!(info.field("projection-input-dim"), Some(&Reply::Integer(4)));
    assert_eq!(info.field("vector-dim"), Some(&Reply::Integer(2)));
    assert_eq!(info.field("size"), Some(&Reply::Integer(2)));

    let hits = engine.command(["VSIM", "p", "VALUES", "4", "1", "0", "0", "0", "COUNT", "2"]);
    assert!(labels(&hits).contains(&"x".to_string()));
}

#[test]
fn raw_embedding_and_links() {
    let engine = engine();
    for (label, v) in [("a", ["1", "0"]), ("b", ["0", "1"]), ("c", ["1", "1"])] {
        engine.command(["VADD", "k", "VALUES", "2", v[0], v[1], label]);
    }
    let raw = engine.command(["VEMB", "k", "c", "RAW"]);
    let parts = raw.as_array().unwrap();
    assert_eq!(parts[0], Reply::Simple("int8".to_string()));
    assert_eq!(parts.len(), 4);

    let links = engine.command(["VLINKS", "k", "a"]);
    let layers = links.as_array().unwrap();
    let bottom = labels(layers.last().unwrap());
    assert_eq!(bottom.len(), 2);
    assert!(!bottom.contains(&"a".to_string()));
}

#[test]
fn key_namespace_commands() {
    let engine = engine();
    engine.command(["VADD", "emb:1", "VALUES", "1", "1", "a"]);
    engine.command(["VADD", "emb:2", "VALUES", "1", "1", "a"]);
    engine.command(["SET", "other", "x"]);
    assert_eq!(int(engine.command(["DBSIZE"])), 3);
    let keys = engine.command(["KEYS", "emb:*"]);
    assert_eq!(labels(&keys), vec!["emb:1", "emb:2"]);
    assert_eq!(int(engine.command(["DEL", "emb:1", "other", "ghost"])), 2);
    assert_eq!(int(engine.command(["EXISTS", "emb:1", "emb:2"])), 1);
    assert_eq!(engine.command(["PING"]), Reply::Simple("PONG".to_string()));
    assert_eq!(
        error(engine.command(["FLY", "away"])),
        "ERR unknown command 'fly'"
    );
    assert!(engine.command(["SAVE"]).is_error());
}

#[test]
fn replicated_commands_run_synchronously() {
    let engine = engine();
    engine.command(["VADD", "k", "VALUES", "2", "1", "0", "a"]);
    let args = ["VADD", "k", "VALUES", "2", "0", "1", "b", "CAS"]
        .iter()
        .map(|s| s.as_bytes().to_vec())
        .collect();
    assert_eq!(engine.apply_replicated(args), Reply::Integer(1));
    let metrics = engine.metrics().snapshot();
    assert_eq!(metrics.inserts_background, 0);
    assert_eq!(metrics.inserts_sync, 2);

    let log = engine.replication().since(0);
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].args[0], b"VADD".to_vec());
}
