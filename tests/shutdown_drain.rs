//! Shutdown with a full queue: `finish` must return only after the
//! worker has exited, and no generated files may survive when
//! `save_temps` is off.

use method_jit::{finish, free_iseq, init, submit, IseqBuilder, JitOptions, Opcode};

#[test]
fn finish_with_pending_queue_leaves_no_temp_files() {
    let temp = tempfile::tempdir().unwrap();
    let header_dir = temp.path().join("include");
    std::fs::create_dir_all(&header_dir).unwrap();
    std::fs::write(
        header_dir.join("vm_jit_runtime.h"),
        "#error this header never compiles\n",
    )
    .unwrap();

    let mut opts = JitOptions::enabled();
    opts.temp_dir = temp.path().to_path_buf();
    opts.header_dirs = vec![header_dir.clone()];
    init(opts).unwrap();

    let iseqs: Vec<_> = (0..100)
        .map(|i| {
            let iseq = IseqBuilder::new()
                .encoded(vec![Opcode::PutNil as u64, Opcode::Leave as u64])
                .stack_max(1)
                .location(&format!("m{}", i), "test.rb", i)
                .build();
            for _ in 0..i {
                iseq.record_call();
            }
            submit(&iseq);
            iseq
        })
        .collect();

    // Tombstone a few mid-flight, as a collection would.
    for iseq in iseqs.iter().take(10) {
        free_iseq(iseq);
    }

    finish();

    // Worker has exited and the engine is gone: everything below is a
    // no-op and nothing hangs.
    submit(&iseqs[50]);
    finish();

    // No generated .c/.so/.gch files remain in the temp directory.
    let leftovers: Vec<_> = std::fs::read_dir(temp.path())
        .unwrap()
        .map(|entry| entry.unwrap())
        .filter(|entry| entry.path().is_file())
        .map(|entry| entry.file_name())
        .collect();
    assert!(leftovers.is_empty(), "stray temp files: {:?}", leftovers);
}
