use std::sync::Arc;

use faer::linalg::matmul::matmul;
use faer::mat::{MatMut, MatRef};
use faer::{Accum, Par};
use tensorkit::backend::spec::{
    BackendError, BackendResult, DType, Instruction, Operation, PortableBackend, Program,
    TensorInit, TensorLiteral, TensorSpec,
};
use tensorkit_backend_ref_cpu::{
    matmul_dims, CpuKernelInterceptor, CpuTensor, GenericCpuBackend, TensorData,
};

fn faer_parallelism() -> Par {
    let par = faer::get_global_parallelism();
    if par.degree() == 1 {
        Par::Seq
    } else {
        par
    }
}

/// Routes float matmuls to faer; every other operation keeps the reference kernels.
#[derive(Default, Clone)]
pub struct FaerInterceptor;

impl CpuKernelInterceptor for FaerInterceptor {
    fn try_execute(
        &self,
        op: &Operation,
        inputs: &[CpuTensor],
        output: &TensorSpec,
    ) -> Option<BackendResult<CpuTensor>> {
        match op {
            Operation::Matmul => try_matmul(inputs, output),
            _ => None,
        }
    }
}

type FaerInnerBackend = GenericCpuBackend<FaerInterceptor>;

/// CPU backend that shares the reference semantics and accelerates matrix products via faer.
#[derive(Clone)]
pub struct FaerPortableBackend {
    inner: FaerInnerBackend,
}

impl Default for FaerPortableBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FaerPortableBackend {
    pub fn new() -> Self {
        FaerPortableBackend {
            inner: FaerInnerBackend::with_interceptor(FaerInterceptor),
        }
    }
}

impl PortableBackend for FaerPortableBackend {
    type TensorHandle = CpuTensor;

    fn backend_name(&self) -> &str {
        "faer"
    }

    fn materialize(&self, init: TensorInit) -> BackendResult<Self::TensorHandle> {
        self.inner.materialize(init)
    }

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        self.inner.to_literal(tensor)
    }

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Self::TensorHandle> {
        self.inner.execute_instruction(instruction, inputs)
    }

    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        self.inner.run_program(program, entry_inputs)
    }
}

fn try_matmul(inputs: &[CpuTensor], output: &TensorSpec) -> Option<BackendResult<CpuTensor>> {
    let [lhs, rhs] = inputs else {
        return None;
    };
    let dims = match matmul_dims(lhs.dims(), rhs.dims()) {
        Ok(dims) => dims,
        Err(err) => return Some(Err(err)),
    };
    let data = match (&lhs.data, &rhs.data, output.dtype) {
        (TensorData::F32(a), TensorData::F32(b), DType::F32) => {
            TensorData::F32(Arc::from(matmul_f32(a, b, dims)))
        }
        (TensorData::F64(a), TensorData::F64(b), DType::F64) => {
            TensorData::F64(Arc::from(matmul_f64(a, b, dims)))
        }
        _ => return None,
    };
    if data.len() != output.element_count() {
        return Some(Err(BackendError::execution("matmul output shape mismatch")));
    }
    Some(CpuTensor::new(output.clone(), data))
}

macro_rules! batched_matmul {
    ($name:ident, $ty:ty) => {
        /// Row-major `(batch, m, k) x (batch, k, n)` product.
        ///
        /// Each batch computes `C^T = B^T * A^T` into a column-major `(n, m)` view, whose
        /// buffer is exactly row-major `C`.
        fn $name(lhs: &[$ty], rhs: &[$ty], dims: (usize, usize, usize, usize)) -> Vec<$ty> {
            let (batch, m, k, n) = dims;
            let mut out = vec![0.0 as $ty; batch * m * n];
            if m == 0 || n == 0 || k == 0 {
                return out;
            }
            let par = faer_parallelism();
            for b in 0..batch {
                let a = MatRef::from_row_major_slice(&lhs[b * m * k..(b + 1) * m * k], m, k);
                let bm = MatRef::from_row_major_slice(&rhs[b * k * n..(b + 1) * k * n], k, n);
                let mut out_view =
                    MatMut::from_column_major_slice_mut(&mut out[b * m * n..(b + 1) * m * n], n, m);
                matmul(
                    &mut out_view,
                    Accum::Replace,
                    bm.transpose(),
                    a.transpose(),
                    1.0 as $ty,
                    par,
                );
            }
            out
        }
    };
}

batched_matmul!(matmul_f32, f32);
batched_matmul!(matmul_f64, f64);

/// Register the faer backend under the name `"faer"`.
///
/// This function is called automatically via a static initializer, but can also
/// be called manually to ensure the backend is registered.
pub fn register_faer_backend() {
    tensorkit::backend::registry::register_portable_backend("faer", FaerPortableBackend::new);
}

// Auto-register on library load
#[cfg(not(target_family = "wasm"))]
#[used]
#[link_section = ".init_array"]
static REGISTER_FAER_BACKEND: extern "C" fn() = {
    extern "C" fn register() {
        register_faer_backend();
    }
    register
};

#[cfg(test)]
mod tests {
    use super::*;
    use tensorkit::backend::spec::{Operand, ValueId};

    fn matrix(dims: &[usize], values: Vec<f64>) -> CpuTensor {
        CpuTensor::new(
            TensorSpec::new(DType::F64, dims.to_vec()),
            TensorData::F64(Arc::from(values)),
        )
        .unwrap()
    }

    #[test]
    fn matmul_matches_reference_layout() {
        let lhs = matrix(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let rhs = matrix(&[3, 2], vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let instruction = Instruction {
            id: ValueId(2),
            op: Operation::Matmul,
            operands: vec![Operand::Value(ValueId(0)), Operand::Value(ValueId(1))],
            output: TensorSpec::new(DType::F64, [2, 2]),
        };
        let out = FaerPortableBackend::new()
            .execute_instruction(&instruction, &[lhs, rhs])
            .unwrap();
        match &out.data {
            TensorData::F64(values) => assert_eq!(values.as_ref(), &[58.0, 64.0, 139.0, 154.0]),
            _ => panic!("expected f64 output"),
        }
    }

    #[test]
    fn integer_matmul_falls_back_to_reference() {
        let lhs = CpuTensor::new(
            TensorSpec::new(DType::I32, [1, 2]),
            TensorData::I32(Arc::from(vec![2, 3])),
        )
        .unwrap();
        let rhs = CpuTensor::new(
            TensorSpec::new(DType::I32, [2, 1]),
            TensorData::I32(Arc::from(vec![4, 5])),
        )
        .unwrap();
        assert!(FaerInterceptor
            .try_execute(&Operation::Matmul, &[lhs, rhs], &TensorSpec::new(DType::I32, [1, 1]))
            .is_none());
    }
}
