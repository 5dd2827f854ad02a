//! Skeleton DAG construction (spec §4.1 step 4).

use crate::discovery::DiscoveryReport;
use crate::entities::{DatasetKind, ExtractedEntities};
use planctl_adapter::{FrameworkAdapter, RepoProfile};
use planctl_core::dag::{Edge, Node, PlanDag, ResourceRequest, Tool};
use std::collections::HashMap;

pub struct SkeletonOptions<'a> {
    pub adapter: &'a dyn FrameworkAdapter,
}

fn shell_node(id: &str, node_type: &str, outputs: Vec<String>, commands: Vec<String>) -> Node {
    Node {
        id: id.to_string(),
        node_type: node_type.to_string(),
        tool: Tool::Shell,
        inputs: vec![],
        outputs,
        commands,
        env: HashMap::new(),
        resources: None,
        retry_policy_id: None,
    }
}

fn edge(from: &str, to: &str, reason: Option<&str>) -> Edge {
    Edge {
        from: from.to_string(),
        to: to.to_string(),
        reason: reason.map(|r| r.to_string()),
    }
}

pub fn build_skeleton_dag(entities: &ExtractedEntities, discovery: &DiscoveryReport, opts: &SkeletonOptions) -> PlanDag {
    let mut dag = PlanDag::default();

    dag.nodes.push(Node {
        id: "review.needs_confirm".into(),
        node_type: "manual_review".into(),
        tool: Tool::Manual,
        inputs: vec![],
        outputs: vec![],
        commands: vec![],
        env: HashMap::new(),
        resources: None,
        retry_policy_id: None,
    });

    for repo in &entities.repos {
        let repo_key = repo.repo_key();
        let fetch_id = format!("repo.fetch.{}", repo_key);
        let check_id = format!("repo.check.{}", repo_key);

        dag.nodes.push(shell_node(
            &fetch_id,
            "fetch_repo",
            vec![format!("cache/git/{}", repo_key)],
            vec![format!(
                "git clone --depth 1 {} cache/git/{}",
                repo.clone_url(),
                repo_key
            )],
        ));
        dag.nodes.push(shell_node(
            &check_id,
            "static_checks",
            vec![],
            vec![format!("cd cache/git/{} && (ls > /dev/null)", repo_key)],
        ));
        dag.edges.push(edge(&fetch_id, &check_id, None));
        dag.edges.push(edge(&check_id, "review.needs_confirm", None));
    }

    for dataset in &entities.datasets {
        let label = dataset.label();
        let sample_id = format!("data.sample.{}", label);
        dag.nodes.push(shell_node(
            &sample_id,
            "fetch_dataset_sample",
            vec![format!("cache/hf/{}", label)],
            vec![format!("planctl internal dataset-sample --label {}", label)],
        ));
        dag.edges.push(edge(&sample_id, "review.needs_confirm", None));

        if dataset.kind == DatasetKind::Kaggle {
            let fetch_id = format!("data.fetch.{}", label);
            dag.nodes.push(shell_node(
                &fetch_id,
                "fetch_dataset_kaggle",
                vec![format!("cache/kaggle/{}", label)],
                vec![format!(
                    "kaggle datasets download -d {} -p cache/kaggle/{}",
                    label.replace('-', "/"),
                    label
                )],
            ));
            dag.edges.push(edge(&fetch_id, "review.needs_confirm", None));
        }
    }

    let repo_key_for_chain = entities.repos.first().map(|r| r.repo_key());
    let profile = RepoProfile {
        repo_key: repo_key_for_chain.clone().unwrap_or_default(),
        ..Default::default()
    };
    let shell_plan = opts.adapter.build_shell_plan(&profile);

    let mut setup_outputs = vec!["cache/hf".to_string(), "cache/pip".to_string()];
    if let Some(rk) = &repo_key_for_chain {
        setup_outputs.push(format!("cache/venv/{}", rk));
    }
    dag.nodes.push(shell_node("setup.venv", "setup_venv", setup_outputs, shell_plan.setup));
    dag.nodes.push(shell_node("install.deps", "install_deps", vec![], shell_plan.install));

    let mut train_outputs = Vec::new();
    if let Some(rk) = &repo_key_for_chain {
        train_outputs.push(format!("artifacts/model/{}", rk));
    }
    let mut train_node = shell_node("train.run", "train", train_outputs, shell_plan.train);
    train_node.resources = entities.constraints.as_ref().map(|c| ResourceRequest {
        gpu_count: c.gpu_count,
        gpu_type: c.gpu_type.clone(),
        gpu_mem_gb: c.gpu_mem_gb,
        ..Default::default()
    });
    dag.nodes.push(train_node);

    dag.nodes.push(shell_node(
        "eval.run",
        "eval",
        vec!["report/eval_metrics.json".into()],
        shell_plan.eval,
    ));
    dag.nodes.push(shell_node(
        "report.write",
        "report",
        vec!["report/final_metrics.json".into(), "report/final_report.md".into()],
        vec!["planctl internal write-report".into()],
    ));

    dag.edges.push(edge("review.needs_confirm", "setup.venv", None));
    dag.edges.push(edge("setup.venv", "install.deps", None));
    dag.edges.push(edge("install.deps", "train.run", None));
    dag.edges.push(edge("train.run", "eval.run", None));
    dag.edges.push(edge("eval.run", "report.write", None));

    let _ = discovery;
    dag
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryReport;
    use crate::entities::RepoRef;
    use planctl_adapter::GenericPipAdapter;
    use planctl_dag::validate_dag;

    #[test]
    fn scenario_1_produces_expected_fetch_command() {
        let entities = crate::entities::extract_heuristic("# X\nRepo: foo/bar\n");
        let discovery = DiscoveryReport::default();
        let adapter = GenericPipAdapter;
        let dag = build_skeleton_dag(&entities, &discovery, &SkeletonOptions { adapter: &adapter });

        let node = dag.node("repo.fetch.foo-bar").expect("fetch node present");
        assert!(node.commands[0].starts_with("git clone --depth 1 https://github.com/foo/bar.git cache/git/foo-bar"));
    }

    #[test]
    fn skeleton_dag_is_acyclic_and_has_review_gate_first() {
        let entities = ExtractedEntities {
            repos: vec![RepoRef { owner: "foo".into(), repo: "bar".into() }],
            ..Default::default()
        };
        let discovery = DiscoveryReport::default();
        let adapter = GenericPipAdapter;
        let dag = build_skeleton_dag(&entities, &discovery, &SkeletonOptions { adapter: &adapter });
        let order = validate_dag(&dag).expect("valid dag");
        assert!(order.iter().position(|x| x == "review.needs_confirm").unwrap()
            < order.iter().position(|x| x == "setup.venv").unwrap());
    }

    #[test]
    fn kaggle_dataset_gets_both_sample_and_fetch_nodes() {
        let entities = ExtractedEntities {
            datasets: vec![crate::entities::DatasetRef {
                kind: DatasetKind::Kaggle,
                namespace: "owner".into(),
                name: "ds".into(),
            }],
            ..Default::default()
        };
        let discovery = DiscoveryReport::default();
        let adapter = GenericPipAdapter;
        let dag = build_skeleton_dag(&entities, &discovery, &SkeletonOptions { adapter: &adapter });
        assert!(dag.node("data.sample.owner-ds").is_some());
        assert!(dag.node("data.fetch.owner-ds").is_some());
    }

    #[test]
    fn train_node_gets_inferred_gpu_resources_from_constraints() {
        let entities = ExtractedEntities {
            constraints: Some(crate::entities::Constraints {
                gpu_count: Some(2),
                gpu_type: Some("A100".into()),
                gpu_mem_gb: Some(40.0),
            }),
            ..Default::default()
        };
        let discovery = DiscoveryReport::default();
        let adapter = GenericPipAdapter;
        let dag = build_skeleton_dag(&entities, &discovery, &SkeletonOptions { adapter: &adapter });
        let train = dag.node("train.run").unwrap();
        assert_eq!(train.resources.as_ref().unwrap().gpu_count, Some(2));
        assert!(train.is_gpu_node());
    }
}
