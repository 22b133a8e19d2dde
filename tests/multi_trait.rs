mod common;

use common::{Simulation, init_logging};
use ndarray::{Array2, array};
use qtlscan::{QtlError, ScanConfig, ScanRequest, scan};

struct Inputs {
    y: Array2<f64>,
    g: Array2<f64>,
    k: Array2<f64>,
}

fn two_trait_inputs(seed: u64) -> Inputs {
    let mut sim = Simulation::new(seed, 30);
    let m = sim.covariates(1);
    let (k, features) = sim.kinship(200);
    let g = sim.genotype(4);
    let first = sim.outcome(&m, &array![0.4], &features);
    let second = sim.outcome(&m, &array![-0.2], &features);
    let mut y = Array2::zeros((30, 2));
    y.column_mut(0).assign(&first);
    y.column_mut(1).assign(&(&second * 0.5 + &first * 0.5));
    Inputs { y, g, k }
}

#[test]
fn identity_design_without_h1_reports_only_h0_vs_h2() {
    init_logging();
    let inputs = two_trait_inputs(10);
    let request = ScanRequest::new(inputs.g, inputs.y.clone())
        .kinship(inputs.k)
        .trait_design(Array2::<f64>::eye(2));
    let result = scan(&request, &ScanConfig::default()).unwrap();
    assert!(result.is_multi_trait());
    assert!(!result.has_h1());

    let stats = result.stats().unwrap();
    let names: Vec<&str> = stats.get_column_names().iter().map(|s| s.as_str()).collect();
    assert_eq!(names, vec!["lml0", "lml2", "dof20", "scale2", "pv20"]);
    assert_eq!(stats.height(), 4);
    let dof = stats.column("dof20").unwrap().u32().unwrap();
    assert!(dof.into_iter().all(|d| d == Some(2)));

    let lml0 = result.h0().lml;
    assert!(lml0.is_finite());
    for record in result.records() {
        assert!(record.h2.lml >= lml0 - 1e-6);
    }

    // Per test: one row per (trait, covariate) and one per (candidate, env).
    let effsizes = result.effsizes_h2().unwrap();
    assert_eq!(effsizes.height(), 4 * (2 + 2));
    let traits = effsizes.column("trait").unwrap().str().unwrap();
    let env = effsizes.column("env").unwrap().str().unwrap();
    let kind = effsizes.column("effect_type").unwrap().str().unwrap();
    assert_eq!(traits.get(0), Some("trait0"));
    assert_eq!(traits.get(1), Some("trait1"));
    assert_eq!(env.get(0), None);
    assert_eq!(kind.get(2), Some("candidate"));
    assert_eq!(traits.get(2), None);
    assert_eq!(env.get(2), Some("trait0"));
    assert_eq!(env.get(3), Some("trait1"));
    assert!(result.effsizes_h1().unwrap().is_none());

    let c0 = result.h0().c0().unwrap();
    let c1 = result.h0().c1().unwrap();
    assert_eq!(c0.dim(), (2, 2));
    assert!(c1[[0, 0]] > 0.0 && c1[[1, 1]] > 0.0);
}

#[test]
fn nested_env_designs_give_three_comparisons() {
    let inputs = two_trait_inputs(11);
    let request = ScanRequest::new(inputs.g, inputs.y)
        .kinship(inputs.k)
        .trait_design(Array2::<f64>::eye(2))
        .h1_env(array![[1.0], [1.0]])
        .h2_env(array![[1.0, 0.0], [0.0, 1.0]]);
    let result = scan(&request, &ScanConfig::default()).unwrap();
    assert!(result.has_h1());
    assert_eq!(result.env0(), ["env0_0".to_string()]);
    assert_eq!(result.env1(), ["env1_0".to_string(), "env1_1".to_string()]);

    let stats = result.stats().unwrap();
    for column in ["pv10", "pv20", "pv21"] {
        let pv = stats.column(column).unwrap().f64().unwrap();
        assert!(pv.into_iter().all(|p| p.is_some_and(|p| (0.0..=1.0).contains(&p))));
    }
    let dof10 = stats.column("dof10").unwrap().u32().unwrap();
    let dof20 = stats.column("dof20").unwrap().u32().unwrap();
    let dof21 = stats.column("dof21").unwrap().u32().unwrap();
    for i in 0..stats.height() {
        assert_eq!(dof10.get(i), Some(1));
        assert_eq!(dof20.get(i), Some(3));
        assert_eq!(dof21.get(i), Some(dof20.get(i).unwrap() - dof10.get(i).unwrap()));
    }

    let lml0 = result.h0().lml;
    for record in result.records() {
        let h1 = record.h1.as_ref().unwrap();
        assert!(h1.lml >= lml0 - 1e-6);
        assert!(record.h2.lml >= h1.lml - 1e-6);
    }
    assert_eq!(result.effsizes_h1().unwrap().map(|df| df.height()), Some(4 * 3));
    assert!(result.to_string().contains("P-values"));
}

#[test]
fn multi_trait_glmm_is_unsupported() {
    let inputs = two_trait_inputs(12);
    let y = inputs.y.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
    let request = ScanRequest::new(inputs.g, y)
        .likelihood("bernoulli")
        .trait_design(Array2::<f64>::eye(2));
    assert!(matches!(
        scan(&request, &ScanConfig::default()),
        Err(QtlError::UnsupportedCombination(_))
    ));
}

#[test]
fn several_traits_without_trait_design_are_unsupported() {
    let inputs = two_trait_inputs(13);
    let request = ScanRequest::new(inputs.g, inputs.y);
    assert!(matches!(
        scan(&request, &ScanConfig::default()),
        Err(QtlError::UnsupportedCombination(_))
    ));
}

#[test]
fn trait_design_with_one_trait_falls_back_to_single_trait() {
    let inputs = two_trait_inputs(14);
    let y = inputs.y.column(0).to_owned();
    let request = ScanRequest::new(inputs.g, y)
        .trait_design(Array2::<f64>::eye(1))
        .h1_env(array![[1.0]]);
    let result = scan(&request, &ScanConfig::default()).unwrap();
    assert!(!result.is_multi_trait());
    assert!(!result.has_h1());
    assert_eq!(result.stats().unwrap().height(), 4);
}

#[test]
fn misshapen_env_design_is_rejected() {
    let inputs = two_trait_inputs(15);
    let request = ScanRequest::new(inputs.g, inputs.y)
        .trait_design(Array2::<f64>::eye(2))
        .h1_env(array![[1.0], [1.0], [1.0]]);
    assert!(matches!(
        scan(&request, &ScanConfig::default()),
        Err(QtlError::ShapeOrLabelMismatch(_))
    ));
}
