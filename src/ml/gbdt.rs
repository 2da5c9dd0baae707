//! LightGBM tree ensembles.
//!
//! Models are read from LightGBM's native text format (`Booster.save_model`)
//! and, failing that, from its JSON dump (`Booster.dump_model`). Both are
//! flattened into the same array-of-nodes representation and evaluated
//! natively. Only numerical splits and single-output objectives are served.

use nalgebra::DMatrix;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::ModelError;

/// LightGBM treats values in `(-K_ZERO, K_ZERO]` as zero for missing-value routing.
const K_ZERO_THRESHOLD: f64 = 1e-35;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MissingType {
    None,
    Zero,
    NaN,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Child {
    Node(usize),
    Leaf(usize),
}

#[derive(Debug, Clone)]
struct SplitNode {
    feature: usize,
    threshold: f64,
    default_left: bool,
    missing: MissingType,
    left: Child,
    right: Child,
}

#[derive(Debug, Clone, Default)]
struct Tree {
    nodes: Vec<SplitNode>,
    leaves: Vec<f64>,
}

impl Tree {
    fn evaluate(&self, row: &[f64]) -> f64 {
        let mut cursor = self.root();

        loop {
            match cursor {
                Child::Leaf(idx) => return self.leaves[idx],
                Child::Node(idx) => {
                    let node = &self.nodes[idx];
                    cursor = if node.goes_left(row[node.feature]) {
                        node.left
                    } else {
                        node.right
                    };
                }
            }
        }
    }

    fn validate(&self, num_features: usize) -> Result<(), ModelError> {
        if self.leaves.is_empty() {
            return Err(ModelError::Format("tree without leaves".to_string()));
        }
        for node in &self.nodes {
            if node.feature >= num_features {
                return Err(ModelError::Format(format!(
                    "split on feature {} but the model has {} features",
                    node.feature, num_features
                )));
            }
        }

        // every split and every leaf is reached exactly once from the root
        let mut seen_nodes = vec![false; self.nodes.len()];
        let mut seen_leaves = vec![false; self.leaves.len()];
        let mut pending = vec![self.root()];
        while let Some(child) = pending.pop() {
            let seen = match child {
                Child::Node(i) => seen_nodes.get_mut(i),
                Child::Leaf(i) => seen_leaves.get_mut(i),
            }
            .ok_or_else(|| ModelError::Format("child index out of range".to_string()))?;
            if *seen {
                return Err(ModelError::Format(format!(
                    "tree structure is not a tree: {:?} is reached twice",
                    child
                )));
            }
            *seen = true;

            if let Child::Node(i) = child {
                pending.push(self.nodes[i].left);
                pending.push(self.nodes[i].right);
            }
        }

        if seen_nodes.iter().chain(&seen_leaves).any(|reached| !reached) {
            return Err(ModelError::Format(
                "tree has nodes that cannot be reached from the root".to_string(),
            ));
        }
        Ok(())
    }

    fn root(&self) -> Child {
        if self.nodes.is_empty() {
            Child::Leaf(0)
        } else {
            Child::Node(0)
        }
    }
}

impl SplitNode {
    fn goes_left(&self, value: f64) -> bool {
        let value = if value.is_nan() && self.missing != MissingType::NaN {
            0.0
        } else {
            value
        };

        let is_missing = match self.missing {
            MissingType::Zero => value > -K_ZERO_THRESHOLD && value <= K_ZERO_THRESHOLD,
            MissingType::NaN => value.is_nan(),
            MissingType::None => false,
        };

        if is_missing {
            self.default_left
        } else {
            value <= self.threshold
        }
    }
}

/// Output transform implied by the training objective.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Objective {
    Identity,
    SquaredIdentity,
    Exp,
    Sigmoid(f64),
}

impl Objective {
    fn parse(spec: &str) -> Result<Self, ModelError> {
        let mut tokens = spec.split_whitespace();
        let name = tokens
            .next()
            .ok_or_else(|| ModelError::Format("empty objective".to_string()))?;
        let params: HashMap<&str, &str> = tokens.filter_map(|t| t.split_once(':')).collect();
        let has_sqrt = spec.split_whitespace().any(|t| t == "sqrt");

        match name {
            "regression" | "regression_l2" | "regression_l1" | "l2" | "l1" | "mse" | "mae"
            | "huber" | "fair" | "quantile" | "mape" => Ok(if has_sqrt {
                Objective::SquaredIdentity
            } else {
                Objective::Identity
            }),
            "poisson" | "gamma" | "tweedie" => Ok(Objective::Exp),
            "binary" => {
                let sigmoid = match params.get("sigmoid") {
                    Some(raw) => raw.parse::<f64>().map_err(|e| {
                        ModelError::Format(format!("bad sigmoid parameter '{}': {}", raw, e))
                    })?,
                    None => 1.0,
                };
                Ok(Objective::Sigmoid(sigmoid))
            }
            "cross_entropy" | "xentropy" => Ok(Objective::Sigmoid(1.0)),
            other => Err(ModelError::Format(format!("unsupported objective '{}'", other))),
        }
    }

    fn apply(&self, raw: f64) -> f64 {
        match self {
            Objective::Identity => raw,
            Objective::SquaredIdentity => raw.signum() * raw * raw,
            Objective::Exp => raw.exp(),
            Objective::Sigmoid(scale) => 1.0 / (1.0 + (-scale * raw).exp()),
        }
    }
}

/// A loaded gradient-boosted tree ensemble.
#[derive(Debug, Clone)]
pub struct GbdtModel {
    trees: Vec<Tree>,
    num_features: usize,
    objective: Objective,
    average_output: bool,
}

impl GbdtModel {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ModelError::Format(format!("cannot read {}: {}", path.display(), e)))?;

        match Self::from_text(&content) {
            Ok(model) => Ok(model),
            Err(text_err) => {
                debug!(
                    "{} is not a LightGBM text model ({}), trying JSON dump",
                    path.display(),
                    text_err
                );
                Self::from_json_dump(&content).map_err(|json_err| {
                    ModelError::Format(format!(
                        "neither a LightGBM text model ({}) nor a LightGBM JSON dump ({})",
                        text_err, json_err
                    ))
                })
            }
        }
    }

    /// Parses LightGBM's native text format.
    pub fn from_text(content: &str) -> Result<Self, ModelError> {
        let mut lines = content.lines().map(str::trim);

        match lines.by_ref().find(|l| !l.is_empty()) {
            Some("tree") => {}
            _ => return Err(ModelError::Format("missing 'tree' header".to_string())),
        }

        let mut header: HashMap<&str, &str> = HashMap::new();
        let mut average_output = false;
        let mut blocks: Vec<HashMap<&str, &str>> = Vec::new();
        let mut finished = false;

        for line in lines {
            if line.is_empty() {
                continue;
            }
            if line == "end of trees" {
                finished = true;
                break;
            }
            if line.starts_with("Tree=") {
                blocks.push(HashMap::new());
                continue;
            }
            match (line.split_once('='), blocks.last_mut()) {
                (Some((key, value)), Some(block)) => {
                    block.insert(key, value);
                }
                (Some((key, value)), None) => {
                    header.insert(key, value);
                }
                (None, None) if line == "average_output" => average_output = true,
                (None, _) => {}
            }
        }

        if !finished {
            return Err(ModelError::Format("missing 'end of trees' marker".to_string()));
        }

        let num_class: usize = parse_scalar(&header, "num_class")?;
        if num_class != 1 {
            return Err(ModelError::Format(format!(
                "multiclass models ({} classes) are not supported",
                num_class
            )));
        }
        let max_feature_idx: usize = parse_scalar(&header, "max_feature_idx")?;
        let objective = Objective::parse(
            header
                .get("objective")
                .ok_or_else(|| ModelError::Format("missing objective".to_string()))?,
        )?;

        let trees = blocks
            .iter()
            .map(tree_from_block)
            .collect::<Result<Vec<_>, _>>()?;

        Self::assemble(trees, max_feature_idx + 1, objective, average_output)
    }

    /// Parses the JSON produced by `Booster.dump_model()`.
    pub fn from_json_dump(content: &str) -> Result<Self, ModelError> {
        let dump: JsonDump = serde_json::from_str(content)
            .map_err(|e| ModelError::Format(format!("invalid JSON dump: {}", e)))?;

        if dump.num_class != 1 {
            return Err(ModelError::Format(format!(
                "multiclass models ({} classes) are not supported",
                dump.num_class
            )));
        }
        let objective = Objective::parse(&dump.objective)?;

        let mut trees = Vec::with_capacity(dump.tree_info.len());
        for info in dump.tree_info {
            let mut tree = Tree::default();
            flatten_json_node(info.tree_structure, &mut tree)?;
            trees.push(tree);
        }

        Self::assemble(trees, dump.max_feature_idx + 1, objective, dump.average_output)
    }

    fn assemble(
        trees: Vec<Tree>,
        num_features: usize,
        objective: Objective,
        average_output: bool,
    ) -> Result<Self, ModelError> {
        if trees.is_empty() {
            return Err(ModelError::Format("model has no trees".to_string()));
        }
        for tree in &trees {
            tree.validate(num_features)?;
        }

        Ok(Self {
            trees,
            num_features,
            objective,
            average_output,
        })
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn is_probabilistic(&self) -> bool {
        matches!(self.objective, Objective::Sigmoid(_))
    }

    fn raw_score(&self, row: &[f64]) -> f64 {
        let sum: f64 = self.trees.iter().map(|t| t.evaluate(row)).sum();
        if self.average_output {
            sum / self.trees.len() as f64
        } else {
            sum
        }
    }

    fn check_shape(&self, rows: &DMatrix<f64>) -> Result<(), ModelError> {
        if rows.ncols() != self.num_features {
            return Err(ModelError::Shape {
                expected: self.num_features,
                got: rows.ncols(),
            });
        }
        Ok(())
    }

    /// One transformed prediction per row.
    pub fn predict(&self, rows: &DMatrix<f64>) -> Result<Vec<f64>, ModelError> {
        self.check_shape(rows)?;

        Ok(rows
            .row_iter()
            .map(|row| {
                let values: Vec<f64> = row.iter().copied().collect();
                self.objective.apply(self.raw_score(&values))
            })
            .collect())
    }

    /// `[P(down), P(up)]` per row. Only binary objectives produce probabilities.
    pub fn predict_proba(&self, rows: &DMatrix<f64>) -> Result<Vec<[f64; 2]>, ModelError> {
        if !self.is_probabilistic() {
            return Err(ModelError::Evaluation(
                "model objective does not produce class probabilities".to_string(),
            ));
        }

        Ok(self
            .predict(rows)?
            .into_iter()
            .map(|p| [1.0 - p, p])
            .collect())
    }
}

fn parse_scalar<T: std::str::FromStr>(map: &HashMap<&str, &str>, key: &str) -> Result<T, ModelError>
where
    T::Err: std::fmt::Display,
{
    let raw = map
        .get(key)
        .ok_or_else(|| ModelError::Format(format!("missing '{}'", key)))?;
    raw.trim()
        .parse()
        .map_err(|e| ModelError::Format(format!("bad '{}' value '{}': {}", key, raw, e)))
}

fn parse_list<T: std::str::FromStr>(map: &HashMap<&str, &str>, key: &str) -> Result<Vec<T>, ModelError>
where
    T::Err: std::fmt::Display,
{
    map.get(key)
        .copied()
        .unwrap_or("")
        .split_whitespace()
        .map(|raw| {
            raw.parse()
                .map_err(|e| ModelError::Format(format!("bad '{}' entry '{}': {}", key, raw, e)))
        })
        .collect()
}

fn child_from_index(index: i64) -> Child {
    if index >= 0 {
        Child::Node(index as usize)
    } else {
        Child::Leaf((-index - 1) as usize)
    }
}

fn tree_from_block(block: &HashMap<&str, &str>) -> Result<Tree, ModelError> {
    let num_leaves: usize = parse_scalar(block, "num_leaves")?;
    if num_leaves == 0 {
        return Err(ModelError::Format("tree without leaves".to_string()));
    }
    let leaves: Vec<f64> = parse_list(block, "leaf_value")?;
    if leaves.len() != num_leaves {
        return Err(ModelError::Format(format!(
            "expected {} leaf values, found {}",
            num_leaves,
            leaves.len()
        )));
    }

    let is_linear: u8 = block
        .get("is_linear")
        .map(|_| parse_scalar(block, "is_linear"))
        .transpose()?
        .unwrap_or(0);
    if is_linear != 0 {
        return Err(ModelError::Format("linear trees are not supported".to_string()));
    }

    let num_cat: usize = block
        .get("num_cat")
        .map(|_| parse_scalar(block, "num_cat"))
        .transpose()?
        .unwrap_or(0);
    if num_cat > 0 {
        return Err(ModelError::Format("categorical splits are not supported".to_string()));
    }

    let features: Vec<usize> = parse_list(block, "split_feature")?;
    let thresholds: Vec<f64> = parse_list(block, "threshold")?;
    let decision_types: Vec<u8> = parse_list(block, "decision_type")?;
    let left: Vec<i64> = parse_list(block, "left_child")?;
    let right: Vec<i64> = parse_list(block, "right_child")?;

    let internal = num_leaves - 1;
    for (name, len) in [
        ("split_feature", features.len()),
        ("threshold", thresholds.len()),
        ("decision_type", decision_types.len()),
        ("left_child", left.len()),
        ("right_child", right.len()),
    ] {
        if len != internal {
            return Err(ModelError::Format(format!(
                "expected {} '{}' entries, found {}",
                internal, name, len
            )));
        }
    }

    let mut nodes = Vec::with_capacity(internal);
    for i in 0..internal {
        let decision = decision_types[i];
        if decision & 1 != 0 {
            return Err(ModelError::Format("categorical splits are not supported".to_string()));
        }
        let missing = match (decision >> 2) & 3 {
            0 => MissingType::None,
            1 => MissingType::Zero,
            2 => MissingType::NaN,
            other => {
                return Err(ModelError::Format(format!("unknown missing type {}", other)));
            }
        };
        nodes.push(SplitNode {
            feature: features[i],
            threshold: thresholds[i],
            default_left: decision & 2 != 0,
            missing,
            left: child_from_index(left[i]),
            right: child_from_index(right[i]),
        });
    }

    Ok(Tree { nodes, leaves })
}

#[derive(Debug, Deserialize)]
struct JsonDump {
    num_class: usize,
    max_feature_idx: usize,
    objective: String,
    #[serde(default)]
    average_output: bool,
    tree_info: Vec<JsonTreeInfo>,
}

#[derive(Debug, Deserialize)]
struct JsonTreeInfo {
    tree_structure: JsonNode,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonNode {
    Split {
        split_feature: usize,
        threshold: serde_json::Value,
        decision_type: String,
        default_left: bool,
        missing_type: String,
        left_child: Box<JsonNode>,
        right_child: Box<JsonNode>,
    },
    Leaf {
        leaf_value: f64,
    },
}

fn flatten_json_node(node: JsonNode, tree: &mut Tree) -> Result<Child, ModelError> {
    match node {
        JsonNode::Leaf { leaf_value } => {
            tree.leaves.push(leaf_value);
            Ok(Child::Leaf(tree.leaves.len() - 1))
        }
        JsonNode::Split {
            split_feature,
            threshold,
            decision_type,
            default_left,
            missing_type,
            left_child,
            right_child,
        } => {
            if decision_type != "<=" {
                return Err(ModelError::Format(format!(
                    "unsupported decision type '{}'",
                    decision_type
                )));
            }
            let threshold = threshold
                .as_f64()
                .ok_or_else(|| ModelError::Format(format!("bad threshold {}", threshold)))?;
            let missing = match missing_type.as_str() {
                "None" => MissingType::None,
                "Zero" => MissingType::Zero,
                "NaN" => MissingType::NaN,
                other => {
                    return Err(ModelError::Format(format!("unknown missing type '{}'", other)));
                }
            };

            let idx = tree.nodes.len();
            tree.nodes.push(SplitNode {
                feature: split_feature,
                threshold,
                default_left,
                missing,
                left: Child::Leaf(0),
                right: Child::Leaf(0),
            });
            let left = flatten_json_node(*left_child, tree)?;
            let right = flatten_json_node(*right_child, tree)?;
            tree.nodes[idx].left = left;
            tree.nodes[idx].right = right;
            Ok(Child::Node(idx))
        }
    }
}

/// Single-split model on feature 0 in LightGBM text format.
#[cfg(test)]
pub(crate) fn stump_text(
    objective: &str,
    num_features: usize,
    threshold: f64,
    left: f64,
    right: f64,
) -> String {
    format!(
        "tree\nversion=v3\nnum_class=1\nmax_feature_idx={}\nobjective={}\n\n\
         Tree=0\nnum_leaves=2\nnum_cat=0\nsplit_feature=0\nthreshold={}\ndecision_type=2\n\
         left_child=-1\nright_child=-2\nleaf_value={} {}\n\nend of trees\n",
        num_features - 1,
        objective,
        threshold,
        left,
        right
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_model(objective: &str, decision_type: &str) -> String {
        format!(
            "tree\nversion=v3\nnum_class=1\nnum_tree_per_iteration=1\nlabel_index=0\n\
             max_feature_idx=1\nobjective={objective}\nfeature_names=f0 f1\n\n\
             Tree=0\nnum_leaves=3\nnum_cat=0\nsplit_feature=0 1\nsplit_gain=1 1\n\
             threshold=2 3.5\ndecision_type={decision_type} 2\nleft_child=-1 -2\nright_child=1 -3\n\
             leaf_value=1 2 3\nshrinkage=1\n\n\n\
             Tree=1\nnum_leaves=1\nnum_cat=0\nsplit_feature=\nthreshold=\ndecision_type=\n\
             left_child=\nright_child=\nleaf_value=0.5\nshrinkage=1\n\n\n\
             end of trees\n\nfeature_importances:\nf0=1\n"
        )
    }

    fn row(values: &[f64]) -> DMatrix<f64> {
        DMatrix::from_row_slice(1, values.len(), values)
    }

    #[test]
    fn evaluates_text_model() {
        let model = GbdtModel::from_text(&text_model("regression", "2")).unwrap();
        assert_eq!(model.num_trees(), 2);
        assert_eq!(model.num_features(), 2);
        assert_eq!(model.predict(&row(&[1.0, 9.0])).unwrap(), vec![1.5]);
        assert_eq!(model.predict(&row(&[3.0, 3.0])).unwrap(), vec![2.5]);
        assert_eq!(model.predict(&row(&[3.0, 4.0])).unwrap(), vec![3.5]);
    }

    #[test]
    fn routes_missing_values() {
        // missing type None: NaN is treated as 0.0 and compared normally
        let none = GbdtModel::from_text(&text_model("regression", "0")).unwrap();
        assert_eq!(none.predict(&row(&[f64::NAN, 9.0])).unwrap(), vec![1.5]);

        // missing type NaN, default right
        let nan_right = GbdtModel::from_text(&text_model("regression", "8")).unwrap();
        assert_eq!(nan_right.predict(&row(&[f64::NAN, 9.0])).unwrap(), vec![3.5]);

        // missing type Zero, default right
        let zero_right = GbdtModel::from_text(&text_model("regression", "4")).unwrap();
        assert_eq!(zero_right.predict(&row(&[0.0, 1.0])).unwrap(), vec![2.5]);
    }

    #[test]
    fn binary_objective_gives_probabilities() {
        let model = GbdtModel::from_text(&text_model("binary sigmoid:1", "2")).unwrap();
        let proba = model.predict_proba(&row(&[1.0, 1.0])).unwrap();
        let expected = 1.0 / (1.0 + (-1.5f64).exp());
        assert!((proba[0][1] - expected).abs() < 1e-12);
        assert!((proba[0][0] + proba[0][1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn regression_model_has_no_probabilities() {
        let model = GbdtModel::from_text(&text_model("regression", "2")).unwrap();
        assert!(model.predict_proba(&row(&[1.0, 1.0])).is_err());
    }

    #[test]
    fn rejects_wrong_feature_count() {
        let model = GbdtModel::from_text(&text_model("regression", "2")).unwrap();
        assert!(matches!(
            model.predict(&row(&[1.0, 2.0, 3.0])),
            Err(ModelError::Shape { expected: 2, got: 3 })
        ));
    }

    #[test]
    fn json_dump_matches_text_model() {
        let dump = serde_json::json!({
            "name": "tree",
            "version": "v3",
            "num_class": 1,
            "max_feature_idx": 1,
            "objective": "regression",
            "tree_info": [
                {
                    "tree_index": 0,
                    "tree_structure": {
                        "split_index": 0, "split_feature": 0, "threshold": 2.0,
                        "decision_type": "<=", "default_left": true, "missing_type": "None",
                        "left_child": { "leaf_index": 0, "leaf_value": 1.0 },
                        "right_child": {
                            "split_index": 1, "split_feature": 1, "threshold": 3.5,
                            "decision_type": "<=", "default_left": true, "missing_type": "None",
                            "left_child": { "leaf_index": 1, "leaf_value": 2.0 },
                            "right_child": { "leaf_index": 2, "leaf_value": 3.0 }
                        }
                    }
                },
                { "tree_index": 1, "tree_structure": { "leaf_value": 0.5 } }
            ]
        });
        let json = GbdtModel::from_json_dump(&dump.to_string()).unwrap();
        let text = GbdtModel::from_text(&text_model("regression", "2")).unwrap();

        for values in [[1.0, 9.0], [3.0, 3.0], [3.0, 4.0]] {
            assert_eq!(json.predict(&row(&values)).unwrap(), text.predict(&row(&values)).unwrap());
        }
    }

    #[test]
    fn load_falls_back_to_json_and_reports_both_failures() {
        let dir = tempfile::TempDir::new().unwrap();
        let good = dir.path().join("dump.txt");
        fs::write(
            &good,
            r#"{"num_class":1,"max_feature_idx":0,"objective":"regression",
                "tree_info":[{"tree_structure":{"leaf_value":4.0}}]}"#,
        )
        .unwrap();
        assert_eq!(GbdtModel::load(&good).unwrap().predict(&row(&[0.0])).unwrap(), vec![4.0]);

        let bad = dir.path().join("bad.txt");
        fs::write(&bad, "not a model").unwrap();
        let err = GbdtModel::load(&bad).unwrap_err().to_string();
        assert!(err.contains("text model"));
        assert!(err.contains("JSON dump"));
    }

    #[test]
    fn rejects_categorical_and_multiclass() {
        assert!(GbdtModel::from_text(&text_model("regression", "3")).is_err());
        let multiclass = text_model("multiclass num_class:3", "2").replace("num_class=1", "num_class=3");
        assert!(GbdtModel::from_text(&multiclass).is_err());
    }

    #[test]
    fn rejects_linear_trees() {
        let linear = text_model("regression", "2").replace(
            "Tree=0\nnum_leaves=3\n",
            "Tree=0\nnum_leaves=3\nis_linear=1\nleaf_const=0 0 0\n",
        );
        let err = GbdtModel::from_text(&linear).unwrap_err();
        assert!(err.to_string().contains("linear trees"));

        let constant = text_model("regression", "2")
            .replace("Tree=0\nnum_leaves=3\n", "Tree=0\nnum_leaves=3\nis_linear=0\n");
        assert!(GbdtModel::from_text(&constant).is_ok());
    }

    #[test]
    fn rejects_cyclic_trees() {
        let self_loop = stump_text("regression", 1, 0.0, 1.0, 2.0).replace("left_child=-1\n", "left_child=0\n");
        let err = GbdtModel::from_text(&self_loop).unwrap_err();
        assert!(err.to_string().contains("not a tree"));

        let back_edge = text_model("regression", "2").replace("right_child=1 -3", "right_child=1 0");
        assert!(GbdtModel::from_text(&back_edge).is_err());

        let shared_leaf = stump_text("regression", 1, 0.0, 1.0, 2.0).replace("right_child=-2", "right_child=-1");
        assert!(GbdtModel::from_text(&shared_leaf).is_err());
    }
}
