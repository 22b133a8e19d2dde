use ndarray::{Array2, Axis, array};
use qtlscan::conform::conform;
use qtlscan::{LabeledMatrix, QtlError, ScanConfig, ScanRequest, scan};

fn labelled(values: Array2<f64>, rows: &[&str]) -> LabeledMatrix {
    LabeledMatrix::new(values)
        .with_row_labels(rows.iter().copied())
        .unwrap()
}

fn kinship(labels: &[&str]) -> LabeledMatrix {
    let n = labels.len();
    let k = Array2::from_shape_fn((n, n), |(i, j)| if i == j { 1.0 } else { 0.2 });
    LabeledMatrix::new(k)
        .with_row_labels(labels.iter().copied())
        .unwrap()
        .with_col_labels(labels.iter().copied())
        .unwrap()
}

#[test]
fn repeated_phenotype_label_is_pruned_to_kinship_count() {
    let y = labelled(array![[1.0], [2.0], [3.0], [4.0]], &["s0", "s0", "s1", "s2"]);
    let data = conform(y, None, None, Some(kinship(&["s0", "s1", "s2"]))).unwrap();

    assert_eq!(data.nsamples(), 3);
    assert_eq!(data.samples(), vec!["s0", "s1", "s2"]);
    assert_eq!(data.y.values().column(0).to_vec(), vec![1.0, 3.0, 4.0]);
    assert_eq!(data.y_origin, vec![0, 2, 3]);
    let k = data.k.unwrap();
    assert_eq!(k.labels(Axis(0)), k.labels(Axis(1)));
    assert_eq!(data.m.col_labels(), vec!["offset"]);
}

#[test]
fn disjoint_genotype_labels_fail_the_scan() {
    let y = labelled(array![[1.0], [2.0], [3.0], [4.0]], &["s0", "s0", "s1", "s2"]);
    let g = labelled(array![[0.0], [1.0], [2.0]], &["t0", "t1", "t2"]);
    let request = ScanRequest::new(g, y).kinship(kinship(&["s0", "s1", "s2"]));
    assert!(matches!(
        scan(&request, &ScanConfig::default()),
        Err(QtlError::EmptyIntersection)
    ));
}

#[test]
fn conforming_twice_changes_nothing() {
    let y = labelled(array![[1.0], [2.0], [3.0]], &["b", "a", "c"]);
    let g = labelled(array![[0.0], [1.0], [2.0], [1.0]], &["c", "a", "d", "b"]);
    let m = labelled(array![[1.0], [1.0], [1.0]], &["a", "b", "c"]);
    let once = conform(y, Some(m), Some(g), Some(kinship(&["a", "c", "b"]))).unwrap();
    let twice = conform(
        once.y.clone(),
        Some(once.m.clone()),
        once.g.clone(),
        once.k.clone(),
    )
    .unwrap();
    assert_eq!(once.y, twice.y);
    assert_eq!(once.m, twice.m);
    assert_eq!(once.g, twice.g);
    assert_eq!(once.k, twice.k);
    assert_eq!(once.samples(), vec!["b", "a", "c"]);
    assert_eq!(once.g.unwrap().values().column(0).to_vec(), vec![1.0, 1.0, 0.0]);
}

#[test]
fn unlabelled_inputs_pair_by_position() {
    let y = labelled(array![[1.0], [2.0], [3.0]], &["x", "y", "z"]);
    let g = LabeledMatrix::new(array![[5.0], [6.0], [7.0]]);
    let data = conform(y, None, Some(g), None).unwrap();
    let g = data.g.unwrap();
    assert_eq!(g.row_labels(), vec!["x", "y", "z"]);
    assert_eq!(g.values().column(0).to_vec(), vec![5.0, 6.0, 7.0]);

    let y = labelled(array![[1.0], [2.0], [3.0]], &["x", "y", "z"]);
    let short = LabeledMatrix::new(array![[5.0], [6.0]]);
    assert!(matches!(
        conform(y, None, Some(short), None),
        Err(QtlError::ShapeOrLabelMismatch(_))
    ));
}

#[test]
fn integer_inputs_are_cast_to_float() {
    let y = LabeledMatrix::from(ndarray::Array1::from(vec![1i64, 0, 1]));
    let g = LabeledMatrix::from(array![[0i64, 1], [1, 2], [2, 0]]);
    let data = conform(y, None, Some(g), None).unwrap();
    assert_eq!(data.samples(), vec!["sample0", "sample1", "sample2"]);
    assert_eq!(data.g.unwrap().values()[[1, 1]], 2.0);
}
