//! End-to-end mapping plan execution against a real filesystem.
//!
//! Remote tasks need a gateway; everything filesystem-side is exercised here
//! with plans built directly from tasks, plus full DSL round-trips for the
//! parse-and-order layer.

use std::fs;

use wkube_core::config::AgentConfig;
use wkube_core::gateway::GatewayClient;
use wkube_core::mapping::{self, MappingExecutor, MappingPlan, MappingTask, Selections};

fn offline_gateway() -> GatewayClient {
    GatewayClient::new(&AgentConfig {
        gateway_url: "https://localhost:1".to_string(),
        auth_token: "test-token".to_string(),
        pod_id: "pod".to_string(),
        log_file_name: "job-pod.log".to_string(),
        input_mappings: String::new(),
        output_mappings: String::new(),
        selected_filenames: None,
        selected_foldernames: None,
        interactive_socket: None,
        debug_mapping_path: None,
        tls_no_verify: true,
    })
    .unwrap()
}

#[tokio::test]
async fn symlinks_run_before_transfers_and_share_through_pipe() {
    let dir = tempfile::tempdir().unwrap();
    let pipe = dir.path().join("pipe-volume");
    fs::create_dir_all(&pipe).unwrap();
    let graph = dir.path().join("graph-volume");
    fs::create_dir_all(&graph).unwrap();
    fs::write(graph.join("bulk.dat"), b"payload").unwrap();

    let work = dir.path().join("work");
    let link = work.join("data");

    // The graph copy lands inside the directory the symlink creates first;
    // running the transfer before the link would materialize a plain
    // directory where the link belongs.
    let plan = MappingPlan {
        symlinks: vec![MappingTask::Symlink {
            mounted: pipe.display().to_string(),
            link: link.display().to_string(),
        }],
        input_transfers: vec![MappingTask::CopyFromGraph {
            source: graph.display().to_string(),
            destination: link.join("bulk").display().to_string(),
        }],
        output_transfers: vec![],
    };

    let gateway = offline_gateway();
    MappingExecutor::new(&gateway).run_pre(&plan).await.unwrap();

    assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    // The copy travelled through the link into the pipe volume.
    assert_eq!(
        fs::read(pipe.join("bulk").join("bulk.dat")).unwrap(),
        b"payload"
    );
}

#[tokio::test]
async fn post_run_copies_outputs_to_graph() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    fs::create_dir_all(out.join("sub")).unwrap();
    fs::write(out.join("sub").join("result.csv"), b"1,2,3").unwrap();
    let graph = dir.path().join("graph-store");

    let plan = MappingPlan {
        symlinks: vec![],
        input_transfers: vec![],
        output_transfers: vec![MappingTask::CopyToGraph {
            source: out.display().to_string(),
            destination: graph.display().to_string(),
        }],
    };

    let gateway = offline_gateway();
    MappingExecutor::new(&gateway).run_post(&plan).await.unwrap();

    assert_eq!(
        fs::read(graph.join("sub").join("result.csv")).unwrap(),
        b"1,2,3"
    );
}

#[tokio::test]
async fn first_failing_task_aborts_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent-file.dat");
    let pipe = dir.path().join("pipe");
    fs::create_dir_all(&pipe).unwrap();
    let late_link = dir.path().join("late-link");

    let plan = MappingPlan {
        symlinks: vec![
            // Missing non-directory mounted source: hard error.
            MappingTask::Symlink {
                mounted: missing.display().to_string(),
                link: dir.path().join("x").display().to_string(),
            },
            MappingTask::Symlink {
                mounted: pipe.display().to_string(),
                link: late_link.display().to_string(),
            },
        ],
        input_transfers: vec![],
        output_transfers: vec![],
    };

    let gateway = offline_gateway();
    assert!(MappingExecutor::new(&gateway).run_pre(&plan).await.is_err());
    // The queue stopped at the failure; the later link never appeared.
    assert!(fs::symlink_metadata(&late_link).is_err());
}

#[test]
fn dsl_to_plan_is_rejected_without_side_effects() {
    // Relative destination: rejected at plan time, nothing touches the disk.
    let err = mapping::build_plan(
        "/mnt/pipe/shared:relative-destination",
        "",
        &Selections::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        mapping::MappingError::RelativeDestination { .. }
    ));
}

#[test]
fn selection_cardinality_is_checked_before_any_work() {
    let selections = Selections {
        files: Some(vec!["a.txt".to_string(), "b.txt".to_string()]),
        folders: None,
    };
    let err =
        mapping::build_plan("selected_files:/in/one.txt", "", &selections).unwrap_err();
    assert!(matches!(
        err,
        mapping::MappingError::SelectionCardinality { count: 2 }
    ));
}
